//! Role instantiation and digest-verified hot-swap.
//!
//! A `ChangeRole` packet names a peer, a role, and the SHA-256 digest of
//! the role's content as the sender knows it. The local provider supplies
//! the digest of its own implementation; any mismatch means the mesh would
//! run diverging role code, so the swap is refused, the halt signal is
//! raised, and the new role is never activated.

use crate::core::header::PacketHeader;
use crate::core::packet::ParsedPacket;
use crate::error::{MeshError, Result};
use crate::relay::{
    BroadcastRole, ListenerRole, MidnodeRole, RelayRole, RoleContext, SessionRole, ROLE_BROADCAST,
    ROLE_IDLE, ROLE_LISTENER, ROLE_MIDNODE,
};
use crate::utils::lock;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Supplies role instances and their content digests. The core never loads
/// code; embedders register whatever roles they ship.
pub trait RoleProvider: Send + Sync {
    fn relay_role(&self, name: &str) -> Option<Arc<dyn RelayRole>>;

    fn session_role(&self, name: &str) -> Option<Arc<dyn SessionRole>>;

    /// SHA-256 digest of the named role's content, or `None` for roles
    /// this provider does not know.
    fn digest(&self, name: &str) -> Option<[u8; 32]>;
}

type RelayFactory = Box<dyn Fn() -> Arc<dyn RelayRole> + Send + Sync>;
type SessionFactory = Box<dyn Fn() -> Arc<dyn SessionRole> + Send + Sync>;

struct RelayEntry {
    factory: RelayFactory,
    digest: [u8; 32],
}

struct SessionEntry {
    factory: SessionFactory,
    digest: [u8; 32],
}

/// In-process [`RoleProvider`] backed by registered factories.
#[derive(Default)]
pub struct RoleRegistry {
    relay: Mutex<HashMap<String, RelayEntry>>,
    session: Mutex<HashMap<String, SessionEntry>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in roles, digested over their names.
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register_relay(ROLE_BROADCAST, Self::name_digest(ROLE_BROADCAST), || {
            Arc::new(BroadcastRole::new())
        });
        registry.register_relay(ROLE_LISTENER, Self::name_digest(ROLE_LISTENER), || {
            Arc::new(ListenerRole::new())
        });
        registry.register_relay(ROLE_MIDNODE, Self::name_digest(ROLE_MIDNODE), || {
            Arc::new(MidnodeRole::new())
        });
        registry
    }

    /// Digest of a bare role name; the convention for built-in roles whose
    /// content ships with the crate itself.
    pub fn name_digest(name: &str) -> [u8; 32] {
        Sha256::digest(name.as_bytes()).into()
    }

    pub fn register_relay<F>(&self, name: &str, digest: [u8; 32], factory: F)
    where
        F: Fn() -> Arc<dyn RelayRole> + Send + Sync + 'static,
    {
        lock(&self.relay).insert(
            name.to_string(),
            RelayEntry {
                factory: Box::new(factory),
                digest,
            },
        );
    }

    pub fn register_session<F>(&self, name: &str, digest: [u8; 32], factory: F)
    where
        F: Fn() -> Arc<dyn SessionRole> + Send + Sync + 'static,
    {
        lock(&self.session).insert(
            name.to_string(),
            SessionEntry {
                factory: Box::new(factory),
                digest,
            },
        );
    }
}

impl RoleProvider for RoleRegistry {
    fn relay_role(&self, name: &str) -> Option<Arc<dyn RelayRole>> {
        lock(&self.relay).get(name).map(|entry| (entry.factory)())
    }

    fn session_role(&self, name: &str) -> Option<Arc<dyn SessionRole>> {
        lock(&self.session).get(name).map(|entry| (entry.factory)())
    }

    fn digest(&self, name: &str) -> Option<[u8; 32]> {
        lock(&self.relay)
            .get(name)
            .map(|entry| entry.digest)
            .or_else(|| lock(&self.session).get(name).map(|entry| entry.digest))
    }
}

/// The between-things session role: owns no traffic, but handles role
/// hot-swap requests for the local node.
pub struct IdleRole {
    provider: Arc<dyn RoleProvider>,
    ctx: Mutex<Option<Arc<RoleContext>>>,
}

impl IdleRole {
    pub fn new(provider: Arc<dyn RoleProvider>) -> Self {
        Self {
            provider,
            ctx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SessionRole for IdleRole {
    fn name(&self) -> &str {
        ROLE_IDLE
    }

    async fn activate(&self, ctx: Arc<RoleContext>) -> Result<()> {
        let provider = self.provider.clone();
        let handler_ctx = ctx.clone();
        ctx.dispatcher.register(
            PacketHeader::ChangeRole,
            5,
            ROLE_IDLE,
            "role-swap",
            move |_, packet| {
                let ParsedPacket::ChangeRole {
                    peer_id,
                    relay,
                    role_name,
                    digest,
                } = packet
                else {
                    return;
                };
                handle_change_role(&handler_ctx, &provider, *peer_id, *relay, role_name, digest);
            },
        )?;
        *lock(&self.ctx) = Some(ctx);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if let Some(ctx) = lock(&self.ctx).take() {
            ctx.dispatcher.unregister_owner(ROLE_IDLE);
        }
        Ok(())
    }
}

/// Check a requested swap against what the local provider ships.
fn verify_swap(provider: &dyn RoleProvider, role_name: &str, digest: &[u8]) -> Result<()> {
    let expected = provider
        .digest(role_name)
        .ok_or_else(|| MeshError::UnknownRole(role_name.to_string()))?;
    if digest != expected.as_slice() {
        return Err(MeshError::RoleHashMismatch {
            role: role_name.to_string(),
        });
    }
    Ok(())
}

/// Apply one `ChangeRole` request. Digest verification happens before the
/// role is even instantiated: a mismatched role must never observe
/// activation.
fn handle_change_role(
    ctx: &Arc<RoleContext>,
    provider: &Arc<dyn RoleProvider>,
    peer_id: i32,
    relay: bool,
    role_name: &str,
    digest: &[u8],
) {
    if let Err(e) = verify_swap(provider.as_ref(), role_name, digest) {
        error!(error = %e, "refusing role swap, halting");
        ctx.halt.raise();
        return;
    }

    let Some(peer) = ctx.directory.peer_by_id(peer_id) else {
        warn!(peer = peer_id, "role swap names an unregistered peer");
        return;
    };
    info!(peer = peer_id, role = role_name, relay, "applying role swap");

    let ctx = ctx.clone();
    if relay {
        let Some(role) = provider.relay_role(role_name) else {
            error!(role = role_name, "provider refused to instantiate role, halting");
            ctx.halt.raise();
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = ctx.directory.set_relay_role(&peer, Some(role), &ctx).await {
                error!(peer = peer.id(), error = %e, "relay role swap failed");
                ctx.halt.raise();
            }
        });
    } else {
        let Some(role) = provider.session_role(role_name) else {
            error!(role = role_name, "provider refused to instantiate role, halting");
            ctx.halt.raise();
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = ctx
                .directory
                .set_session_role(&peer, Some(role), &ctx)
                .await
            {
                error!(peer = peer.id(), error = %e, "session role swap failed");
                ctx.halt.raise();
            }
        });
    }
}
