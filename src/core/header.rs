//! # Packet Headers
//!
//! The closed registry of wire headers. Every frame starts with an 8-byte
//! prefix of `[sender_id: i32][header_code: i32]`, both big-endian; the
//! header code selects the payload layout and bounds the frame size.
//!
//! `Any` and `Direct` are pseudo-headers: `Any` is a dispatch wildcard and
//! `Direct` tags side-channel packets re-injected into the dispatcher.
//! Neither is ever transmitted, and their codes are rejected on the wire.

/// Sentinel id carried by peers whose wire id has not been confirmed yet.
/// Never suggested or assigned to a real peer.
pub const RESERVED_ID: i32 = i32::MAX;

/// Wire header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketHeader {
    /// Dispatch wildcard. Never transmitted.
    Any,
    /// Side-channel wrapper. Never transmitted.
    Direct,
    Error,
    Ping,
    ReturnPing,
    Connect,
    AssignId,
    Disconnect,
    ChangeName,
    UpdateSettings,
    SetReady,
    SyncCountdown,
    BeginCountdown,
    InterruptReady,
    SendNetInfo,
    Chat,
    Whisper,
    ChangeRole,
    DestroyingChannel,
}

impl PacketHeader {
    /// Every header that can appear on the wire, in code order.
    pub const TRANSMISSIBLE: [PacketHeader; 17] = [
        PacketHeader::Error,
        PacketHeader::Ping,
        PacketHeader::ReturnPing,
        PacketHeader::Connect,
        PacketHeader::AssignId,
        PacketHeader::Disconnect,
        PacketHeader::ChangeName,
        PacketHeader::UpdateSettings,
        PacketHeader::SetReady,
        PacketHeader::SyncCountdown,
        PacketHeader::BeginCountdown,
        PacketHeader::InterruptReady,
        PacketHeader::SendNetInfo,
        PacketHeader::Chat,
        PacketHeader::Whisper,
        PacketHeader::ChangeRole,
        PacketHeader::DestroyingChannel,
    ];

    /// Numeric wire code.
    pub const fn code(self) -> i32 {
        match self {
            PacketHeader::Any => -2,
            PacketHeader::Direct => -3,
            PacketHeader::Error => -1,
            PacketHeader::Ping => 1,
            PacketHeader::ReturnPing => 2,
            PacketHeader::Connect => 3,
            PacketHeader::AssignId => 4,
            PacketHeader::Disconnect => 5,
            PacketHeader::ChangeName => 7,
            PacketHeader::UpdateSettings => 8,
            PacketHeader::SetReady => 9,
            PacketHeader::SyncCountdown => 11,
            PacketHeader::BeginCountdown => 12,
            PacketHeader::InterruptReady => 13,
            PacketHeader::SendNetInfo => 14,
            PacketHeader::Chat => 15,
            PacketHeader::Whisper => 16,
            PacketHeader::ChangeRole => 17,
            PacketHeader::DestroyingChannel => 18,
        }
    }

    /// Resolve a wire code. Pseudo-header codes are not wire codes and
    /// resolve to `None`, as does anything unknown.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(PacketHeader::Error),
            1 => Some(PacketHeader::Ping),
            2 => Some(PacketHeader::ReturnPing),
            3 => Some(PacketHeader::Connect),
            4 => Some(PacketHeader::AssignId),
            5 => Some(PacketHeader::Disconnect),
            7 => Some(PacketHeader::ChangeName),
            8 => Some(PacketHeader::UpdateSettings),
            9 => Some(PacketHeader::SetReady),
            11 => Some(PacketHeader::SyncCountdown),
            12 => Some(PacketHeader::BeginCountdown),
            13 => Some(PacketHeader::InterruptReady),
            14 => Some(PacketHeader::SendNetInfo),
            15 => Some(PacketHeader::Chat),
            16 => Some(PacketHeader::Whisper),
            17 => Some(PacketHeader::ChangeRole),
            18 => Some(PacketHeader::DestroyingChannel),
            _ => None,
        }
    }

    /// Maximum total frame size (prefix included) for this header.
    pub const fn max_frame_size(self) -> usize {
        match self {
            PacketHeader::Any | PacketHeader::Direct => 0,
            PacketHeader::Error => 256,
            PacketHeader::Ping | PacketHeader::ReturnPing => 18,
            PacketHeader::Connect => 256,
            PacketHeader::AssignId => 18,
            PacketHeader::Disconnect => 256,
            PacketHeader::ChangeName => 256,
            PacketHeader::UpdateSettings => 256,
            PacketHeader::SetReady => 9,
            PacketHeader::SyncCountdown => 13,
            PacketHeader::BeginCountdown => 8,
            PacketHeader::InterruptReady => 8,
            PacketHeader::SendNetInfo => 256,
            PacketHeader::Chat => 512,
            PacketHeader::Whisper => 512,
            PacketHeader::ChangeRole => 128,
            PacketHeader::DestroyingChannel => 8,
        }
    }

    /// Largest frame size across all transmissible headers; read buffers
    /// sized to this can always hold a complete frame.
    pub fn largest_frame_size() -> usize {
        let mut largest = 0;
        for header in Self::TRANSMISSIBLE {
            let size = header.max_frame_size();
            if size > largest {
                largest = size;
            }
        }
        largest
    }

    /// Whether this header may appear on the wire.
    pub const fn is_transmissible(self) -> bool {
        !matches!(self, PacketHeader::Any | PacketHeader::Direct)
    }

    /// Short name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            PacketHeader::Any => "Any",
            PacketHeader::Direct => "Direct",
            PacketHeader::Error => "Error",
            PacketHeader::Ping => "Ping",
            PacketHeader::ReturnPing => "ReturnPing",
            PacketHeader::Connect => "Connect",
            PacketHeader::AssignId => "AssignId",
            PacketHeader::Disconnect => "Disconnect",
            PacketHeader::ChangeName => "ChangeName",
            PacketHeader::UpdateSettings => "UpdateSettings",
            PacketHeader::SetReady => "SetReady",
            PacketHeader::SyncCountdown => "SyncCountdown",
            PacketHeader::BeginCountdown => "BeginCountdown",
            PacketHeader::InterruptReady => "InterruptReady",
            PacketHeader::SendNetInfo => "SendNetInfo",
            PacketHeader::Chat => "Chat",
            PacketHeader::Whisper => "Whisper",
            PacketHeader::ChangeRole => "ChangeRole",
            PacketHeader::DestroyingChannel => "DestroyingChannel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_roundtrip() {
        for header in PacketHeader::TRANSMISSIBLE {
            assert_eq!(PacketHeader::from_code(header.code()), Some(header));
        }
    }

    #[test]
    fn pseudo_headers_are_not_wire_codes() {
        assert_eq!(PacketHeader::from_code(PacketHeader::Any.code()), None);
        assert_eq!(PacketHeader::from_code(PacketHeader::Direct.code()), None);
        assert!(!PacketHeader::Any.is_transmissible());
        assert!(!PacketHeader::Direct.is_transmissible());
    }

    #[test]
    fn largest_frame_covers_every_header() {
        let largest = PacketHeader::largest_frame_size();
        assert_eq!(largest, 512);
        for header in PacketHeader::TRANSMISSIBLE {
            assert!(header.max_frame_size() <= largest);
        }
    }

    #[test]
    fn every_frame_fits_its_prefix() {
        for header in PacketHeader::TRANSMISSIBLE {
            assert!(header.max_frame_size() >= 8, "{} too small", header.name());
        }
    }
}
