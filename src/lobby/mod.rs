//! # Session Negotiation
//!
//! The lobby phase: a host opens a rendezvous listener, joiners connect and
//! announce themselves, ids are negotiated, readiness is gathered, and a
//! countdown hands the group off to a fully-connected mesh with relay roles
//! assigned.
//!
//! ## Components
//! - **Host**: Rendezvous listener, id suggestion, countdown authority
//! - **Joiner**: Rendezvous client, roster tracking
//! - **Mesh**: Full-matrix establishment and the resulting [`Session`]
//!
//! After the topology handoff every lobby structure is torn down; the
//! session starts from a rebuilt peer directory holding fresh peer objects.

pub mod host;
pub mod joiner;
pub mod mesh;

pub use host::HostedLobby;
pub use joiner::JoinedLobby;
pub use mesh::Session;

use crate::error::{MeshError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lobby phase, host-authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    /// Accepting joiners, nobody ready.
    Open,
    /// At least one member ready, countdown not started.
    ReadyCheck,
    /// All members ready, countdown ticking.
    Counting,
    /// Topology announced, mesh forming.
    HandingOff,
    /// Mesh complete, lobby gone.
    Connected,
}

/// Session-wide settings negotiated in the lobby. Opaque to the protocol:
/// the lobby stores and forwards the serialized blob unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub entries: BTreeMap<String, String>,
}

impl SessionSettings {
    pub fn to_bytes(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| MeshError::Serialization(e.to_string()))
    }
}

/// One lobby chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub author: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_pass_through_unchanged() {
        let mut settings = SessionSettings::default();
        settings
            .entries
            .insert("map".to_string(), "highlands".to_string());
        settings
            .entries
            .insert("speed".to_string(), "fast".to_string());
        let bytes = settings.to_bytes().expect("serialize");
        let back = SessionSettings::from_bytes(&bytes).expect("deserialize");
        assert_eq!(back, settings);
    }
}
