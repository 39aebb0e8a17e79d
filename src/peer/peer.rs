//! Peer identity.
//!
//! A peer's map identity is a process-unique token, not its wire id: every
//! freshly accepted connection starts as a partial peer carrying the
//! reserved sentinel id, and several partials can coexist until the host
//! confirms their ids. The partial is upgraded in place, never replaced.

use crate::core::header::RESERVED_ID;
use crate::utils::{read, write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// One session member, local or remote.
#[derive(Debug)]
pub struct Peer {
    token: u64,
    state: RwLock<PeerState>,
}

#[derive(Debug)]
struct PeerState {
    id: i32,
    name: String,
    ready: bool,
}

impl Peer {
    pub fn new(id: i32, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            state: RwLock::new(PeerState {
                id,
                name: name.into(),
                ready: false,
            }),
        })
    }

    /// A peer whose wire id is not confirmed yet.
    pub fn partial() -> Arc<Self> {
        Self::new(RESERVED_ID, "")
    }

    /// Process-unique identity token. Stable across id confirmation.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn id(&self) -> i32 {
        read(&self.state).id
    }

    pub fn set_id(&self, id: i32) {
        write(&self.state).id = id;
    }

    pub fn name(&self) -> String {
        read(&self.state).name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        write(&self.state).name = name.into();
    }

    pub fn is_ready(&self) -> bool {
        read(&self.state).ready
    }

    pub fn set_ready(&self, ready: bool) {
        write(&self.state).ready = ready;
    }

    pub fn is_partial(&self) -> bool {
        self.id() == RESERVED_ID
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_upgrade_keeps_identity() {
        let peer = Peer::partial();
        let token = peer.token();
        assert!(peer.is_partial());
        peer.set_id(1338);
        peer.set_name("alice");
        assert!(!peer.is_partial());
        assert_eq!(peer.token(), token);
        assert_eq!(peer.id(), 1338);
    }

    #[test]
    fn equality_is_by_token_not_id() {
        let a = Peer::partial();
        let b = Peer::partial();
        assert_ne!(a, b);
        assert_eq!(a.id(), b.id());
    }
}
