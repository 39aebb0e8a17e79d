//! # Relay Roles
//!
//! Pluggable per-peer relay behavior over the connection mesh. Exactly one
//! relay role is active on the local peer at a time; while active it owns
//! the read loops over the session channels, the direct side-channel
//! acceptor, and the link monitors.
//!
//! ## Components
//! - **Broadcast**: Hub role; re-dispatches and fans frames out verbatim
//! - **Listener**: Leaf role; all traffic flows through a single upstream
//! - **Midnode**: Interior role with one peer above and a subtree below
//! - **Provider**: Role instantiation and digest-verified hot-swap
//!
//! Roles move between `Inactive` and `Active` only through paired
//! `activate`/`deactivate` calls, and deactivation waits for the role's
//! background tasks to finish before the sockets are touched again.

pub mod broadcast;
pub mod listener;
pub mod midnode;
pub mod provider;

pub use broadcast::BroadcastRole;
pub use listener::ListenerRole;
pub use midnode::{verify_topology, MidnodeRole};
pub use provider::{IdleRole, RoleProvider, RoleRegistry};

use crate::config::MeshConfig;
use crate::core::packet::ParsedPacket;
use crate::error::{constants, MeshError, Result};
use crate::peer::{Peer, PeerDirectory};
use crate::protocol::Dispatcher;
use crate::transport::direct;
use crate::transport::DirectChannels;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

/// Role name of [`BroadcastRole`].
pub const ROLE_BROADCAST: &str = "broadcast";
/// Role name of [`ListenerRole`].
pub const ROLE_LISTENER: &str = "listener";
/// Role name of [`MidnodeRole`].
pub const ROLE_MIDNODE: &str = "midnode";
/// Role name of [`IdleRole`].
pub const ROLE_IDLE: &str = "idle";

/// Where a peer sits in the relay tree, from the local mid-node's point of
/// view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RelayPlacement {
    /// Not part of the local node's relay neighborhood.
    #[default]
    None,
    /// The single peer the local node forwards upward to.
    Above,
    /// A peer in the subtree below the local node: either directly
    /// connected, or routed through a parent in that subtree.
    Below {
        direct: bool,
        parent: Option<Arc<Peer>>,
    },
}

/// Process-level halt request. Raised when continuing would desynchronize
/// the session, such as refusing a role swap the rest of the mesh performs.
/// Observable instead of terminal so embedders and tests decide how to die.
#[derive(Debug, Clone)]
pub struct HaltSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for HaltSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl HaltSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self) {
        // send_replace updates the value even with zero receivers; plain
        // send would fail and leave the flag unraised.
        self.tx.send_replace(true);
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Shared runtime handed to roles on activation: the peer directory, the
/// dispatcher, configuration, the halt signal, and the direct side-channel
/// table.
pub struct RoleContext {
    pub directory: Arc<PeerDirectory>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: MeshConfig,
    pub halt: HaltSignal,
    pub(crate) direct: DirectChannels,
}

impl RoleContext {
    pub fn new(
        directory: Arc<PeerDirectory>,
        dispatcher: Arc<Dispatcher>,
        config: MeshConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory,
            dispatcher,
            config,
            halt: HaltSignal::new(),
            direct: DirectChannels::new(),
        })
    }

    /// Wire id of the local peer.
    pub fn local_id(&self) -> Result<i32> {
        self.directory
            .local_peer()
            .map(|p| p.id())
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_NO_LOCAL_PEER.to_string()))
    }

    /// Open a direct side channel to `peer` if none exists. Idempotent.
    pub async fn ensure_direct_connection(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<()> {
        direct::ensure_direct_connection(self, peer).await
    }

    /// Send over an established side channel.
    pub fn send_directly(&self, peer: &Arc<Peer>, packet: &ParsedPacket) -> Result<()> {
        direct::send_directly(self, peer, packet)
    }

    /// Whether a side channel to `peer` is currently open.
    pub fn has_direct_connection(&self, peer: &Arc<Peer>) -> bool {
        self.direct.is_connected(peer)
    }

    /// Tear down the side channel to `peer`, if any.
    pub async fn destroy_unnecessary_connection(&self, peer: &Arc<Peer>) -> Result<()> {
        direct::destroy_unnecessary_connection(self, peer).await
    }

    /// Start the inbound side-channel acceptor. Called by roles on
    /// activation; the returned handle is shut down on deactivation.
    pub async fn start_direct_acceptor(self: &Arc<Self>) -> Result<direct::DirectAcceptor> {
        direct::DirectAcceptor::bind(self.clone()).await
    }
}

/// A relay behavior the local peer can host.
#[async_trait]
pub trait RelayRole: Send + Sync {
    /// Stable role name, matched during hot-swap and upstream resolution.
    fn name(&self) -> &str;

    /// Take ownership of the session read loops and start the role's
    /// background tasks. Paired with `deactivate`; re-entrant across pairs.
    async fn activate(&self, ctx: Arc<RoleContext>) -> Result<()>;

    /// Stop the role's tasks, wait for them to finish, and hand the
    /// session channels back.
    async fn deactivate(&self) -> Result<()>;

    /// Relay a pre-encoded frame to this role's neighbors, skipping every
    /// peer in `except`.
    fn send_data(&self, frame: Bytes, except: &[Arc<Peer>]) -> Result<()>;
}

/// A non-relay behavior slot (lobby logic, idle session handling).
#[async_trait]
pub trait SessionRole: Send + Sync {
    fn name(&self) -> &str;

    async fn activate(&self, ctx: Arc<RoleContext>) -> Result<()>;

    async fn deactivate(&self) -> Result<()>;
}
