//! # Protocol Layer
//!
//! Packet routing between the wire and the rest of the system.
//!
//! ## Components
//! - **Dispatcher**: Priority-ordered handler registry keyed by packet header

pub mod dispatcher;

pub use dispatcher::Dispatcher;
