//! The peer directory.
//!
//! Authoritative, coarse-locked map from peers to their network state:
//! address, channel, relay placement, roles, and the list of peers each
//! member is directly connected with. One mutex guards the whole table;
//! multi-step reads take it once and never hold it across an await.

use crate::error::{MeshError, Result};
use crate::peer::Peer;
use crate::relay::{RelayPlacement, RelayRole, RoleContext, SessionRole};
use crate::transport::Channel;
use crate::utils::lock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Network state of one registered peer.
pub struct NetInfo {
    /// Address, `None` only for the local peer.
    pub addr: Option<IpAddr>,
    /// Live channel, `None` before the mesh connects (or for the local peer).
    pub channel: Option<Arc<Channel>>,
    pub relay_role: Option<Arc<dyn RelayRole>>,
    pub session_role: Option<Arc<dyn SessionRole>>,
    pub placement: RelayPlacement,
    /// Peers this one is directly connected with. Never contains the peer
    /// itself.
    pub connected_with: Vec<Arc<Peer>>,
}

impl NetInfo {
    fn empty() -> Self {
        Self {
            addr: None,
            channel: None,
            relay_role: None,
            session_role: None,
            placement: RelayPlacement::None,
            connected_with: Vec::new(),
        }
    }
}

#[derive(Default)]
struct DirectoryInner {
    local: Option<Arc<Peer>>,
    peers: Vec<Arc<Peer>>,
    info: HashMap<u64, NetInfo>,
}

/// The authoritative peer table for one session.
#[derive(Default)]
pub struct PeerDirectory {
    inner: Mutex<DirectoryInner>,
}

impl PeerDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the local peer. Local lookups always succeed afterwards.
    pub fn set_local_peer(&self, peer: Arc<Peer>) {
        let mut inner = lock(&self.inner);
        if !inner.info.contains_key(&peer.token()) {
            inner.peers.push(peer.clone());
            inner.info.insert(peer.token(), NetInfo::empty());
        }
        inner.local = Some(peer);
    }

    pub fn local_peer(&self) -> Option<Arc<Peer>> {
        lock(&self.inner).local.clone()
    }

    pub fn is_local(&self, peer: &Arc<Peer>) -> bool {
        lock(&self.inner)
            .local
            .as_ref()
            .is_some_and(|local| local.token() == peer.token())
    }

    /// Register a remote peer reachable over a live channel.
    pub fn register_with_channel(&self, peer: Arc<Peer>, channel: Arc<Channel>) {
        let addr = channel.peer_addr().ip();
        let mut info = NetInfo::empty();
        info.addr = Some(addr);
        info.channel = Some(channel);
        self.insert(peer, info);
    }

    /// Register a remote peer known only by address.
    pub fn register_with_addr(&self, peer: Arc<Peer>, addr: IpAddr) {
        let mut info = NetInfo::empty();
        info.addr = Some(addr);
        self.insert(peer, info);
    }

    fn insert(&self, peer: Arc<Peer>, info: NetInfo) {
        let mut inner = lock(&self.inner);
        if inner.info.insert(peer.token(), info).is_none() {
            inner.peers.push(peer);
        } else {
            debug!(peer = peer.id(), "re-registered peer, replacing state");
        }
    }

    pub fn is_registered(&self, peer: &Arc<Peer>) -> bool {
        lock(&self.inner).info.contains_key(&peer.token())
    }

    /// Drop a peer and return its final state.
    pub fn remove(&self, peer: &Arc<Peer>) -> Option<NetInfo> {
        let mut inner = lock(&self.inner);
        inner.peers.retain(|p| p.token() != peer.token());
        if inner
            .local
            .as_ref()
            .is_some_and(|local| local.token() == peer.token())
        {
            inner.local = None;
        }
        inner.info.remove(&peer.token())
    }

    /// All registered peers, in registration order, local peer included.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        lock(&self.inner).peers.clone()
    }

    /// All registered peers except the local one.
    pub fn remote_peers(&self) -> Vec<Arc<Peer>> {
        let inner = lock(&self.inner);
        let local_token = inner.local.as_ref().map(|p| p.token());
        inner
            .peers
            .iter()
            .filter(|p| Some(p.token()) != local_token)
            .cloned()
            .collect()
    }

    pub fn peer_by_id(&self, id: i32) -> Option<Arc<Peer>> {
        lock(&self.inner)
            .peers
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    pub fn channel_of(&self, peer: &Arc<Peer>) -> Option<Arc<Channel>> {
        lock(&self.inner)
            .info
            .get(&peer.token())
            .and_then(|info| info.channel.clone())
    }

    pub fn addr_of(&self, peer: &Arc<Peer>) -> Option<IpAddr> {
        lock(&self.inner)
            .info
            .get(&peer.token())
            .and_then(|info| info.addr)
    }

    pub fn placement_of(&self, peer: &Arc<Peer>) -> RelayPlacement {
        lock(&self.inner)
            .info
            .get(&peer.token())
            .map(|info| info.placement.clone())
            .unwrap_or(RelayPlacement::None)
    }

    pub fn set_placement(&self, peer: &Arc<Peer>, placement: RelayPlacement) -> Result<()> {
        let mut inner = lock(&self.inner);
        let info = inner
            .info
            .get_mut(&peer.token())
            .ok_or(MeshError::UnknownPeer(peer.id()))?;
        info.placement = placement;
        Ok(())
    }

    /// Record which peers `peer` is directly connected with, dropping any
    /// self reference from the list.
    pub fn set_connected_with(&self, peer: &Arc<Peer>, connected: Vec<Arc<Peer>>) -> Result<()> {
        let mut inner = lock(&self.inner);
        let info = inner
            .info
            .get_mut(&peer.token())
            .ok_or(MeshError::UnknownPeer(peer.id()))?;
        info.connected_with = connected
            .into_iter()
            .filter(|p| p.token() != peer.token())
            .collect();
        Ok(())
    }

    pub fn connections_of(&self, peer: &Arc<Peer>) -> Vec<Arc<Peer>> {
        lock(&self.inner)
            .info
            .get(&peer.token())
            .map(|info| info.connected_with.clone())
            .unwrap_or_default()
    }

    pub fn relay_role_of(&self, peer: &Arc<Peer>) -> Option<Arc<dyn RelayRole>> {
        lock(&self.inner)
            .info
            .get(&peer.token())
            .and_then(|info| info.relay_role.clone())
    }

    pub fn session_role_of(&self, peer: &Arc<Peer>) -> Option<Arc<dyn SessionRole>> {
        lock(&self.inner)
            .info
            .get(&peer.token())
            .and_then(|info| info.session_role.clone())
    }

    /// Peers currently holding a relay role with the given name.
    pub fn peers_with_relay_role(&self, name: &str) -> Vec<Arc<Peer>> {
        let inner = lock(&self.inner);
        inner
            .peers
            .iter()
            .filter(|p| {
                inner
                    .info
                    .get(&p.token())
                    .and_then(|info| info.relay_role.as_ref())
                    .is_some_and(|role| role.name() == name)
            })
            .cloned()
            .collect()
    }

    /// Assign a relay role. When the peer is local the old role is fully
    /// deactivated before the new one activates; both run outside the
    /// directory lock.
    pub async fn set_relay_role(
        &self,
        peer: &Arc<Peer>,
        role: Option<Arc<dyn RelayRole>>,
        ctx: &Arc<RoleContext>,
    ) -> Result<()> {
        let (previous, is_local) = {
            let mut inner = lock(&self.inner);
            let is_local = inner
                .local
                .as_ref()
                .is_some_and(|local| local.token() == peer.token());
            let info = inner
                .info
                .get_mut(&peer.token())
                .ok_or(MeshError::UnknownPeer(peer.id()))?;
            let previous = info.relay_role.take();
            info.relay_role = role.clone();
            (previous, is_local)
        };
        if is_local {
            if let Some(previous) = previous {
                previous.deactivate().await?;
            }
            if let Some(role) = role {
                role.activate(ctx.clone()).await?;
            }
        }
        Ok(())
    }

    /// Assign a session role, with the same local activate/deactivate
    /// pairing as [`set_relay_role`](Self::set_relay_role).
    pub async fn set_session_role(
        &self,
        peer: &Arc<Peer>,
        role: Option<Arc<dyn SessionRole>>,
        ctx: &Arc<RoleContext>,
    ) -> Result<()> {
        let (previous, is_local) = {
            let mut inner = lock(&self.inner);
            let is_local = inner
                .local
                .as_ref()
                .is_some_and(|local| local.token() == peer.token());
            let info = inner
                .info
                .get_mut(&peer.token())
                .ok_or(MeshError::UnknownPeer(peer.id()))?;
            let previous = info.session_role.take();
            info.session_role = role.clone();
            (previous, is_local)
        };
        if is_local {
            if let Some(previous) = previous {
                previous.deactivate().await?;
            }
            if let Some(role) = role {
                role.activate(ctx.clone()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_with_drops_self_reference() {
        let directory = PeerDirectory::new();
        let a = Peer::new(1337, "a");
        let b = Peer::new(1338, "b");
        directory.set_local_peer(a.clone());
        directory.register_with_addr(b.clone(), IpAddr::from([127, 0, 0, 1]));

        directory
            .set_connected_with(&a, vec![a.clone(), b.clone()])
            .expect("set");
        let connections = directory.connections_of(&a);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].token(), b.token());
    }

    #[test]
    fn unregistered_lookups_are_guarded() {
        let directory = PeerDirectory::new();
        let ghost = Peer::new(9999, "ghost");
        assert!(!directory.is_registered(&ghost));
        assert!(directory.channel_of(&ghost).is_none());
        assert!(directory.addr_of(&ghost).is_none());
        assert!(matches!(
            directory.set_placement(&ghost, RelayPlacement::Above),
            Err(MeshError::UnknownPeer(9999))
        ));
    }

    #[test]
    fn remote_peers_excludes_the_local_peer() {
        let directory = PeerDirectory::new();
        let local = Peer::new(1337, "host");
        let a = Peer::new(1338, "a");
        let b = Peer::new(1339, "b");
        directory.set_local_peer(local.clone());
        directory.register_with_addr(a.clone(), IpAddr::from([127, 0, 0, 1]));
        directory.register_with_addr(b.clone(), IpAddr::from([127, 0, 0, 1]));

        let remotes = directory.remote_peers();
        assert_eq!(remotes.len(), 2);
        assert!(remotes.iter().all(|p| p.token() != local.token()));
        assert_eq!(directory.peers().len(), 3);
    }

    #[test]
    fn local_peer_is_always_resolvable() {
        let directory = PeerDirectory::new();
        let local = Peer::new(1337, "host");
        directory.set_local_peer(local.clone());
        assert!(directory.is_registered(&local));
        assert!(directory.is_local(&local));
        assert_eq!(
            directory.local_peer().map(|p| p.token()),
            Some(local.token())
        );
    }

    #[test]
    fn remove_clears_local_slot() {
        let directory = PeerDirectory::new();
        let local = Peer::new(1337, "host");
        directory.set_local_peer(local.clone());
        directory.remove(&local);
        assert!(directory.local_peer().is_none());
        assert!(!directory.is_registered(&local));
    }
}
