//! # Core Wire Components
//!
//! Low-level packet handling: headers, payload codecs, and stream framing.
//!
//! This module is the foundation of the mesh wire format. Everything above
//! it works in terms of [`packet::ParsedPacket`] and [`codec::Frame`].
//!
//! ## Wire Format
//! ```text
//! [SenderId(4, BE)] [HeaderCode(4, BE)] [Payload(N)]
//! ```
//!
//! There is no length prefix; each header's payload layout is
//! self-describing and bounded by a per-header maximum frame size.
//!
//! ## Components
//! - **Header**: The closed registry of wire headers and frame size caps
//! - **Wire**: Big-endian field primitives and port derivation
//! - **Packet**: Parsed packet variants with their payload codecs
//! - **Codec**: Tokio codec for framing over byte streams

pub mod codec;
pub mod header;
pub mod packet;
pub mod wire;
