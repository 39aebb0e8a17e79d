//! # Transport Layer
//!
//! TCP plumbing under the relay tree.
//!
//! ## Components
//! - **Channel**: One framed connection with a queued writer task
//! - **Direct**: The point-to-point side channel outside the relay tree

pub mod channel;
pub mod direct;

pub use channel::{Channel, FrameReader};
pub use direct::{DirectAcceptor, DirectChannels};
