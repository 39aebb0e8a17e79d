//! # Parsed Packets
//!
//! One variant per transmissible header, plus the `Direct` wrapper for
//! side-channel re-injection. Payload codecs consume a cursor positioned
//! just past the 8-byte frame prefix and must consume exactly their frame's
//! bytes; encoders append to the caller's buffer without resetting it.
//!
//! Round-trip law: `decode(encode(p)) == p` for every transmissible packet.

use crate::core::header::PacketHeader;
use crate::core::wire;
use crate::error::{MeshError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::IpAddr;

/// Id negotiation message. A joiner's wish rides its `Connect` announce
/// (the optional id field); the host answers with `Assign`, naming the
/// settled id and the peer it is aimed at. `Request` is the wish-less ask
/// in payload form: decoded for wire completeness, never sent by the
/// negotiation here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignId {
    Request,
    Assign { id: i32, target: i32 },
}

/// One entry of the topology handoff map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: i32,
    pub addr: IpAddr,
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPacket {
    Error { message: String },
    Ping { sent_at_nanos: i64 },
    ReturnPing { sent_at_nanos: i64 },
    Connect { id: Option<i32>, ready: bool, name: String },
    AssignId(AssignId),
    Disconnect { reason: String },
    ChangeName { name: String },
    UpdateSettings { payload: Bytes },
    SetReady { ready: bool },
    SyncCountdown { remaining_secs: i32 },
    BeginCountdown,
    InterruptReady,
    SendNetInfo { peers: Vec<PeerAddr> },
    Chat { message: String },
    Whisper { message: String },
    ChangeRole { peer_id: i32, relay: bool, role_name: String, digest: Vec<u8> },
    DestroyingChannel,
    /// A packet that arrived over the direct side-channel, re-injected into
    /// the dispatcher under the `Direct` pseudo-header.
    Direct(Box<ParsedPacket>),
}

impl ParsedPacket {
    /// The header this packet dispatches under.
    pub fn header(&self) -> PacketHeader {
        match self {
            ParsedPacket::Error { .. } => PacketHeader::Error,
            ParsedPacket::Ping { .. } => PacketHeader::Ping,
            ParsedPacket::ReturnPing { .. } => PacketHeader::ReturnPing,
            ParsedPacket::Connect { .. } => PacketHeader::Connect,
            ParsedPacket::AssignId(_) => PacketHeader::AssignId,
            ParsedPacket::Disconnect { .. } => PacketHeader::Disconnect,
            ParsedPacket::ChangeName { .. } => PacketHeader::ChangeName,
            ParsedPacket::UpdateSettings { .. } => PacketHeader::UpdateSettings,
            ParsedPacket::SetReady { .. } => PacketHeader::SetReady,
            ParsedPacket::SyncCountdown { .. } => PacketHeader::SyncCountdown,
            ParsedPacket::BeginCountdown => PacketHeader::BeginCountdown,
            ParsedPacket::InterruptReady => PacketHeader::InterruptReady,
            ParsedPacket::SendNetInfo { .. } => PacketHeader::SendNetInfo,
            ParsedPacket::Chat { .. } => PacketHeader::Chat,
            ParsedPacket::Whisper { .. } => PacketHeader::Whisper,
            ParsedPacket::ChangeRole { .. } => PacketHeader::ChangeRole,
            ParsedPacket::DestroyingChannel => PacketHeader::DestroyingChannel,
            ParsedPacket::Direct(_) => PacketHeader::Direct,
        }
    }

    /// Append this packet's payload to `buf`.
    pub(crate) fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            ParsedPacket::Error { message } => wire::put_string(buf, message),
            ParsedPacket::Ping { sent_at_nanos } | ParsedPacket::ReturnPing { sent_at_nanos } => {
                buf.put_i64(*sent_at_nanos);
            }
            ParsedPacket::Connect { id, ready, name } => {
                buf.put_u8(u8::from(id.is_some()));
                buf.put_u8(u8::from(*ready));
                if let Some(id) = id {
                    buf.put_i32(*id);
                }
                wire::put_string(buf, name);
            }
            ParsedPacket::AssignId(assign) => match assign {
                AssignId::Request => buf.put_u8(1),
                AssignId::Assign { id, target } => {
                    buf.put_u8(0);
                    buf.put_i32(*id);
                    buf.put_i32(*target);
                }
            },
            ParsedPacket::Disconnect { reason } => wire::put_string(buf, reason),
            ParsedPacket::ChangeName { name } => wire::put_string(buf, name),
            ParsedPacket::UpdateSettings { payload } => {
                buf.put_i32(payload.len() as i32);
                buf.put_slice(payload);
            }
            ParsedPacket::SetReady { ready } => buf.put_u8(u8::from(*ready)),
            ParsedPacket::SyncCountdown { remaining_secs } => buf.put_i32(*remaining_secs),
            ParsedPacket::BeginCountdown
            | ParsedPacket::InterruptReady
            | ParsedPacket::DestroyingChannel => {}
            ParsedPacket::SendNetInfo { peers } => {
                buf.put_i32(peers.len() as i32);
                for peer in peers {
                    buf.put_i32(peer.id);
                    match peer.addr {
                        IpAddr::V4(v4) => {
                            buf.put_u8(4);
                            buf.put_slice(&v4.octets());
                        }
                        IpAddr::V6(v6) => {
                            buf.put_u8(16);
                            buf.put_slice(&v6.octets());
                        }
                    }
                }
            }
            ParsedPacket::Chat { message } => wire::put_string(buf, message),
            ParsedPacket::Whisper { message } => wire::put_string(buf, message),
            ParsedPacket::ChangeRole {
                peer_id,
                relay,
                role_name,
                digest,
            } => {
                buf.put_i32(*peer_id);
                buf.put_u8(u8::from(*relay));
                wire::put_string(buf, role_name);
                buf.put_i32(digest.len() as i32);
                buf.put_slice(digest);
            }
            ParsedPacket::Direct(_) => {
                return Err(MeshError::NotTransmissible(PacketHeader::Direct.name()))
            }
        }
        Ok(())
    }

    /// Decode the payload of a `header` frame. The cursor starts just past
    /// the 8-byte prefix; on success exactly the frame's bytes have been
    /// consumed.
    pub(crate) fn decode_payload(header: PacketHeader, cur: &mut &[u8]) -> Result<ParsedPacket> {
        let packet = match header {
            PacketHeader::Error => ParsedPacket::Error {
                message: wire::get_string(cur)?,
            },
            PacketHeader::Ping => ParsedPacket::Ping {
                sent_at_nanos: wire::get_i64(cur)?,
            },
            PacketHeader::ReturnPing => ParsedPacket::ReturnPing {
                sent_at_nanos: wire::get_i64(cur)?,
            },
            PacketHeader::Connect => {
                let id_assigned = wire::get_u8(cur)? != 0;
                let ready = wire::get_u8(cur)? != 0;
                let id = if id_assigned {
                    Some(wire::get_i32(cur)?)
                } else {
                    None
                };
                let name = wire::get_string(cur)?;
                ParsedPacket::Connect { id, ready, name }
            }
            PacketHeader::AssignId => {
                let request = wire::get_u8(cur)? != 0;
                if request {
                    ParsedPacket::AssignId(AssignId::Request)
                } else {
                    let id = wire::get_i32(cur)?;
                    let target = wire::get_i32(cur)?;
                    ParsedPacket::AssignId(AssignId::Assign { id, target })
                }
            }
            PacketHeader::Disconnect => ParsedPacket::Disconnect {
                reason: wire::get_string(cur)?,
            },
            PacketHeader::ChangeName => ParsedPacket::ChangeName {
                name: wire::get_string(cur)?,
            },
            PacketHeader::UpdateSettings => {
                let len = wire::get_i32(cur)?;
                if len < 0 {
                    return Err(MeshError::LengthMismatch {
                        header: header.name(),
                    });
                }
                let payload = wire::get_bytes(cur, len as usize)?;
                ParsedPacket::UpdateSettings {
                    payload: Bytes::from(payload),
                }
            }
            PacketHeader::SetReady => ParsedPacket::SetReady {
                ready: wire::get_u8(cur)? != 0,
            },
            PacketHeader::SyncCountdown => ParsedPacket::SyncCountdown {
                remaining_secs: wire::get_i32(cur)?,
            },
            PacketHeader::BeginCountdown => ParsedPacket::BeginCountdown,
            PacketHeader::InterruptReady => ParsedPacket::InterruptReady,
            PacketHeader::SendNetInfo => {
                let count = wire::get_i32(cur)?;
                if count < 0 {
                    return Err(MeshError::LengthMismatch {
                        header: header.name(),
                    });
                }
                let mut peers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = wire::get_i32(cur)?;
                    let addr_len = wire::get_u8(cur)?;
                    let addr = match addr_len {
                        4 => {
                            let octets = wire::get_bytes(cur, 4)?;
                            IpAddr::from([octets[0], octets[1], octets[2], octets[3]])
                        }
                        16 => {
                            let octets = wire::get_bytes(cur, 16)?;
                            let mut arr = [0u8; 16];
                            arr.copy_from_slice(&octets);
                            IpAddr::from(arr)
                        }
                        _ => {
                            return Err(MeshError::LengthMismatch {
                                header: header.name(),
                            })
                        }
                    };
                    peers.push(PeerAddr { id, addr });
                }
                ParsedPacket::SendNetInfo { peers }
            }
            PacketHeader::Chat => ParsedPacket::Chat {
                message: wire::get_string(cur)?,
            },
            PacketHeader::Whisper => ParsedPacket::Whisper {
                message: wire::get_string(cur)?,
            },
            PacketHeader::ChangeRole => {
                let peer_id = wire::get_i32(cur)?;
                let relay = wire::get_u8(cur)? != 0;
                let role_name = wire::get_string(cur)?;
                let digest_len = wire::get_i32(cur)?;
                if digest_len < 0 {
                    return Err(MeshError::LengthMismatch {
                        header: header.name(),
                    });
                }
                let digest = wire::get_bytes(cur, digest_len as usize)?;
                ParsedPacket::ChangeRole {
                    peer_id,
                    relay,
                    role_name,
                    digest,
                }
            }
            PacketHeader::DestroyingChannel => ParsedPacket::DestroyingChannel,
            PacketHeader::Any | PacketHeader::Direct => {
                return Err(MeshError::NotTransmissible(header.name()))
            }
        };
        Ok(packet)
    }
}

/// Encode a complete frame: 8-byte prefix followed by the payload, bounded
/// by the header's maximum frame size.
pub fn encode_frame(sender_id: i32, packet: &ParsedPacket) -> Result<Bytes> {
    let header = packet.header();
    if !header.is_transmissible() {
        return Err(MeshError::NotTransmissible(header.name()));
    }
    let mut buf = BytesMut::with_capacity(header.max_frame_size());
    buf.put_i32(sender_id);
    buf.put_i32(header.code());
    packet.encode_payload(&mut buf)?;
    if buf.len() > header.max_frame_size() {
        return Err(MeshError::OversizedFrame {
            header: header.name(),
            len: buf.len(),
            max: header.max_frame_size(),
        });
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_packets_refuse_to_encode() {
        let inner = ParsedPacket::Chat {
            message: "hi".into(),
        };
        let wrapped = ParsedPacket::Direct(Box::new(inner));
        assert!(matches!(
            encode_frame(1337, &wrapped),
            Err(MeshError::NotTransmissible(_))
        ));
    }

    #[test]
    fn oversized_chat_is_rejected() {
        let message: String = std::iter::repeat('x').take(300).collect();
        let packet = ParsedPacket::Chat { message };
        assert!(matches!(
            encode_frame(1337, &packet),
            Err(MeshError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn connect_with_and_without_id() {
        for id in [None, Some(1338)] {
            let packet = ParsedPacket::Connect {
                id,
                ready: true,
                name: "alice".into(),
            };
            let frame = encode_frame(i32::MAX, &packet).expect("encode");
            let mut cur = &frame[8..];
            let decoded =
                ParsedPacket::decode_payload(PacketHeader::Connect, &mut cur).expect("decode");
            assert!(cur.is_empty());
            assert_eq!(decoded, packet);
        }
    }
}
