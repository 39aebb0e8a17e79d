//! # Frame Codec
//!
//! Streaming frame extraction over TCP. Frames carry no length prefix; each
//! payload codec knows exactly how many bytes it consumes, so the decoder
//! attempts a parse and maps "ran out of bytes" to "wait for more". Once a
//! buffer holds a header's maximum frame size and still cannot be parsed,
//! the stream is corrupt and the connection must be dropped.
//!
//! Each decoded [`Frame`] retains its exact original bytes so relays can
//! forward frames verbatim without a re-encode.

use crate::core::header::PacketHeader;
use crate::core::packet::{encode_frame, ParsedPacket};
use crate::error::{MeshError, Result};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A decoded frame together with its original bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sender_id: i32,
    pub packet: ParsedPacket,
    /// The complete frame as it appeared on the wire, prefix included.
    pub raw: Bytes,
}

impl Frame {
    pub fn header(&self) -> PacketHeader {
        self.packet.header()
    }

    /// Build a frame locally, as if it had just been decoded.
    pub fn from_packet(sender_id: i32, packet: ParsedPacket) -> Result<Self> {
        let raw = encode_frame(sender_id, &packet)?;
        Ok(Self {
            sender_id,
            packet,
            raw,
        })
    }
}

/// Stream codec for the relay wire format.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MeshError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 8 {
            return Ok(None);
        }
        let sender_id = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let code = i32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let header = PacketHeader::from_code(code).ok_or(MeshError::UnknownHeader(code))?;

        let mut cur = &src[8..];
        let before = cur.len();
        match ParsedPacket::decode_payload(header, &mut cur) {
            Ok(packet) => {
                let total = 8 + (before - cur.len());
                if total > header.max_frame_size() {
                    return Err(MeshError::OversizedFrame {
                        header: header.name(),
                        len: total,
                        max: header.max_frame_size(),
                    });
                }
                let raw = src.split_to(total).freeze();
                Ok(Some(Frame {
                    sender_id,
                    packet,
                    raw,
                }))
            }
            // Not enough buffered yet, unless a full-size frame could not
            // parse, in which case the declared lengths are lying.
            Err(MeshError::Truncated) => {
                if src.len() >= header.max_frame_size() {
                    Err(MeshError::LengthMismatch {
                        header: header.name(),
                    })
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = MeshError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
