use uuid::Uuid;

use crate::{InboundPacketType, WireError, MAGIC, PROTOCOL_VERSION, SEND_OFFSET, TOKEN_SIZE};

/// Helper to parse inbound packet buffers.
///
/// The reader is positional: getters return the next field and advance. Use
/// [`PacketReader::validate`] first; it guarantees the header is well formed,
/// the type byte is known and the fixed payload for that type fits the
/// buffer, so subsequent in-order getters cannot underrun.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PacketReader {
            data,
            offset: SEND_OFFSET,
        }
    }

    /// Structural validation. Returns false (never panics) if the buffer is
    /// shorter than the header, the magic or version bytes mismatch, the
    /// type byte is unknown, or the type's fixed payload does not fit.
    /// LOGIN additionally requires an exactly empty payload.
    pub fn validate(&self) -> bool {
        if self.data.len() < SEND_OFFSET {
            return false;
        }
        if self.data[..3] != MAGIC || self.data[3] != PROTOCOL_VERSION {
            return false;
        }
        let kind = match InboundPacketType::from_id(self.data[4]) {
            Some(kind) => kind,
            None => return false,
        };
        let payload = self.data.len() - SEND_OFFSET;
        match kind {
            InboundPacketType::Login => payload == 0,
            other => payload >= other.payload_size(),
        }
    }

    /// The packet's type byte, if it maps to a known inbound type.
    pub fn packet_type(&self) -> Option<InboundPacketType> {
        self.data.get(4).copied().and_then(InboundPacketType::from_id)
    }

    fn take(&mut self, wanted: usize) -> Result<&'a [u8], WireError> {
        let available = self.data.len().saturating_sub(self.offset);
        if available < wanted {
            return Err(WireError::Truncated {
                offset: self.offset,
                wanted,
                available,
            });
        }
        let slice = &self.data[self.offset..self.offset + wanted];
        self.offset += wanted;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i16(&mut self) -> Result<i16, WireError> {
        let bytes = self.take(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(arr))
    }

    pub fn get_f32(&mut self) -> Result<f32, WireError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a session token written as two little-endian u64 halves,
    /// most-significant half first.
    pub fn get_uuid(&mut self) -> Result<Uuid, WireError> {
        let bytes = self.take(TOKEN_SIZE)?;
        let mut half = [0u8; 8];
        half.copy_from_slice(&bytes[..8]);
        let msb = u64::from_le_bytes(half);
        half.copy_from_slice(&bytes[8..]);
        let lsb = u64::from_le_bytes(half);
        Ok(Uuid::from_u64_pair(msb, lsb))
    }
}
