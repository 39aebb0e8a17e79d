//! # Peers and the Peer Directory
//!
//! Identity and bookkeeping for session members.
//!
//! ## Components
//! - **Peer**: Shared, mutable identity (wire id, display name, readiness)
//! - **Directory**: The authoritative map from peers to their network state

mod directory;
mod peer;

pub use directory::{NetInfo, PeerDirectory};
pub use peer::Peer;
