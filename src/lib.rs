//! # relay-mesh
//!
//! Peer-to-peer session networking: a lobby for gathering members and
//! negotiating wire ids, a full-matrix connection mesh, and pluggable
//! relay roles (broadcast hub, listener leaf, mid-node) running on top of
//! a compact binary packet protocol.
//!
//! ## Architecture
//! - [`core`]: Packet headers, payload codecs, and the framing codec
//! - [`protocol`]: The priority-ordered dispatch registry
//! - [`peer`]: Peer identity and the per-session peer directory
//! - [`transport`]: Peer channels and the direct side-channel
//! - [`relay`]: Relay roles and digest-verified hot-swap
//! - [`lobby`]: Host/joiner negotiation and mesh establishment
//! - [`config`]: TOML/env configuration with validation
//!
//! ## Quick Start
//! ```no_run
//! use relay_mesh::{HostedLobby, MeshConfig, RoleRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> relay_mesh::Result<()> {
//! let config = MeshConfig::default();
//! let lobby = HostedLobby::open(config, "host").await?;
//! lobby.set_ready(true);
//! let session = lobby.wait_session(Arc::new(RoleRegistry::builtin())).await?;
//! # let _ = session;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod lobby;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod utils;

pub use config::MeshConfig;
pub use core::codec::{Frame, FrameCodec};
pub use core::header::{PacketHeader, RESERVED_ID};
pub use core::packet::{encode_frame, AssignId, ParsedPacket, PeerAddr};
pub use error::{MeshError, Result};
pub use lobby::{
    ChatLine, HostedLobby, JoinedLobby, LobbyState, Session, SessionSettings,
};
pub use peer::{Peer, PeerDirectory};
pub use protocol::Dispatcher;
pub use relay::{
    BroadcastRole, HaltSignal, IdleRole, ListenerRole, MidnodeRole, RelayPlacement, RelayRole,
    RoleContext, RoleProvider, RoleRegistry, SessionRole,
};
