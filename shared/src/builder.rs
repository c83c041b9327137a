use uuid::Uuid;

use crate::{OutboundPacketType, MAGIC, MAX_PACKET_SIZE, PROTOCOL_VERSION};

/// Helper to assemble outbound packets.
///
/// Writes the header and type byte up front, then appends payload fields in
/// declared order. The builder is a consuming chain:
///
/// ```
/// use shared::{OutboundPacketType, PacketBuilder};
///
/// let bytes = PacketBuilder::new(OutboundPacketType::Session)
///     .add_i32(3)
///     .add_uuid(uuid::Uuid::new_v4())
///     .build();
/// assert_eq!(bytes[4], OutboundPacketType::Session.id());
/// ```
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(kind: OutboundPacketType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&MAGIC);
        buf.push(PROTOCOL_VERSION);
        buf.push(kind.id());
        PacketBuilder { buf }
    }

    /// Current packet size, including the header and type byte.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn add_u8(mut self, val: u8) -> Self {
        self.buf.push(val);
        self
    }

    pub fn add_i16(mut self, val: i16) -> Self {
        self.buf.extend_from_slice(&val.to_le_bytes());
        self
    }

    pub fn add_i32(mut self, val: i32) -> Self {
        self.buf.extend_from_slice(&val.to_le_bytes());
        self
    }

    pub fn add_i64(mut self, val: i64) -> Self {
        self.buf.extend_from_slice(&val.to_le_bytes());
        self
    }

    pub fn add_f32(mut self, val: f32) -> Self {
        self.buf.extend_from_slice(&val.to_le_bytes());
        self
    }

    /// Appends a NUL-terminated UTF-8 string.
    pub fn add_string(mut self, val: &str) -> Self {
        self.buf.extend_from_slice(val.as_bytes());
        self.buf.push(0);
        self
    }

    /// Appends a session token as two little-endian u64 halves,
    /// most-significant half first.
    pub fn add_uuid(mut self, val: Uuid) -> Self {
        let (msb, lsb) = val.as_u64_pair();
        self.buf.extend_from_slice(&msb.to_le_bytes());
        self.buf.extend_from_slice(&lsb.to_le_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        debug_assert!(self.buf.len() <= MAX_PACKET_SIZE);
        self.buf
    }
}
