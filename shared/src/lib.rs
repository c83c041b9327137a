//! Binary wire protocol shared between the relay server and its clients.
//!
//! Every packet starts with a fixed header: the three magic bytes `"UTO"`
//! followed by a protocol version byte. Byte 4 is the packet type
//! discriminant; the rest of the packet is a type-specific payload with all
//! multi-byte integers and floats encoded little-endian.
//!
//! [`PacketBuilder`] produces outbound packets by appending fields in
//! declared order; [`PacketReader`] consumes inbound packets the same way.
//! Callers are expected to run [`PacketReader::validate`] before pulling
//! fields out of a packet.

mod builder;
mod reader;

pub use builder::PacketBuilder;
pub use reader::PacketReader;

use thiserror::Error;

/// Magic bytes opening every packet.
pub const MAGIC: [u8; 3] = *b"UTO";

/// Protocol version carried in the fourth header byte.
pub const PROTOCOL_VERSION: u8 = 0;

/// Size of the header plus the type byte; payload fields start here.
pub const SEND_OFFSET: usize = 5;

/// Upper bound on packet size, for both directions.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Wire size of a session token (two little-endian u64 halves).
pub const TOKEN_SIZE: usize = 16;

/// Error produced when a reader runs past the end of a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("packet truncated: wanted {wanted} byte(s) at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        wanted: usize,
        available: usize,
    },
}

/// Packet types sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundPacketType {
    Login,
    Heartbeat,
    PlayerChangeRoom,
    PlayerVisualUpdate,
}

impl InboundPacketType {
    pub fn id(self) -> u8 {
        match self {
            InboundPacketType::Login => 1,
            InboundPacketType::Heartbeat => 2,
            InboundPacketType::PlayerChangeRoom => 10,
            InboundPacketType::PlayerVisualUpdate => 11,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(InboundPacketType::Login),
            2 => Some(InboundPacketType::Heartbeat),
            10 => Some(InboundPacketType::PlayerChangeRoom),
            11 => Some(InboundPacketType::PlayerVisualUpdate),
            _ => None,
        }
    }

    /// Fixed payload size in bytes, excluding the header and type byte.
    pub fn payload_size(self) -> usize {
        match self {
            InboundPacketType::Login => 0,
            InboundPacketType::Heartbeat => TOKEN_SIZE,
            // token, room i16, sprite i16, frame i16, x f32, y f32
            InboundPacketType::PlayerChangeRoom => TOKEN_SIZE + 2 + 2 + 2 + 4 + 4,
            // token, sprite i16, frame i16, x f32, y f32
            InboundPacketType::PlayerVisualUpdate => TOKEN_SIZE + 2 + 2 + 4 + 4,
        }
    }
}

/// Packet types sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPacketType {
    Session,
    Heartbeat,
    PlayerJoinRoom,
    PlayerLeaveRoom,
    PlayerVisualUpdate,
    RatelimitWarning,
    ForceTeleport,
    KickMessage,
}

impl OutboundPacketType {
    pub fn id(self) -> u8 {
        match self {
            OutboundPacketType::Session => 1,
            OutboundPacketType::Heartbeat => 2,
            OutboundPacketType::PlayerJoinRoom => 10,
            OutboundPacketType::PlayerLeaveRoom => 11,
            OutboundPacketType::PlayerVisualUpdate => 12,
            OutboundPacketType::RatelimitWarning => 253,
            OutboundPacketType::ForceTeleport => 254,
            OutboundPacketType::KickMessage => 255,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(OutboundPacketType::Session),
            2 => Some(OutboundPacketType::Heartbeat),
            10 => Some(OutboundPacketType::PlayerJoinRoom),
            11 => Some(OutboundPacketType::PlayerLeaveRoom),
            12 => Some(OutboundPacketType::PlayerVisualUpdate),
            253 => Some(OutboundPacketType::RatelimitWarning),
            254 => Some(OutboundPacketType::ForceTeleport),
            255 => Some(OutboundPacketType::KickMessage),
            _ => None,
        }
    }
}

/// Renders packet bytes as a hex string for protocol diagnostics.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
