//! # Error Types
//!
//! Comprehensive error handling for the relay mesh.
//!
//! This module defines all error variants that can occur during mesh operations,
//! from low-level framing errors to topology and negotiation failures.
//!
//! ## Error Categories
//! - **Framing Errors**: Unknown headers, truncated or oversized frames, length mismatches
//! - **Topology Errors**: ID collisions, invalid relay placement
//! - **Role Errors**: Digest mismatches during hot-swap, unknown role names
//! - **I/O Errors**: Socket failures and closed connections
//! - **Negotiation Errors**: References to unregistered peers, lobby misuse
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Recovery Expectations
//! A `LengthMismatch` or `UnknownHeader` poisons the stream it was read from
//! and the connection must be dropped. `ConnectionClosed` is transient: the
//! peer is removed and the session continues. `UnknownPeer` is answered with
//! an error frame and is never session-fatal.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Framing errors
    pub const ERR_TRUNCATED_FRAME: &str = "Frame ended before its payload was complete";
    pub const ERR_OVERSIZED_FRAME: &str = "Frame exceeds the maximum size for its header";
    pub const ERR_MALFORMED_STRING: &str = "String field is not valid UTF-16";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NO_LOCAL_PEER: &str = "Local peer has not been set";
    pub const ERR_NO_UPSTREAM: &str = "No upstream peer available";

    /// Role errors
    pub const ERR_ROLE_INACTIVE: &str = "Relay role is not active";
}

/// Primary error type for all mesh operations.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown packet header code: {0}")]
    UnknownHeader(i32),

    /// A decoder ran out of bytes mid-payload. Over a stream this means
    /// "wait for more"; over a complete buffer it is a framing error.
    #[error("Truncated frame")]
    Truncated,

    #[error("Length mismatch while decoding {header} frame")]
    LengthMismatch { header: &'static str },

    #[error("Oversized {header} frame: {len} bytes (max {max})")]
    OversizedFrame {
        header: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Header {0} is never transmitted")]
    NotTransmissible(&'static str),

    #[error("String field is not valid UTF-16")]
    MalformedString,

    #[error("Peer id {0} is already taken")]
    IdCollision(i32),

    #[error("Relay topology violation: {0}")]
    TopologyViolation(String),

    #[error("Role digest mismatch for '{role}'")]
    RoleHashMismatch { role: String },

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Peer {0} is not registered")]
    UnknownPeer(i32),

    #[error("No direct channel to peer {0}")]
    NoDirectChannel(i32),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out: {0}")]
    Timeout(&'static str),
}

/// Type alias for Results using MeshError
pub type Result<T> = std::result::Result<T, MeshError>;
