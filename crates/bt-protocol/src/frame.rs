//! Frame header encoding/decoding
//!
//! The frame format uses a 13-byte header:
//! - correlation_id: 8 bytes (u64, big-endian)
//! - frame_kind: 1 byte (u8)
//! - payload_length: 4 bytes (u32, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::correlation::CorrelationId;
use crate::envelope::FrameKind;
use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 13;

/// Maximum payload size (32 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Frame header containing correlation and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Request/response pair this frame belongs to
    pub correlation_id: CorrelationId,
    /// Kind of envelope in the payload
    pub kind: FrameKind,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(correlation_id: CorrelationId, kind: FrameKind, payload_length: u32) -> Self {
        Self {
            correlation_id,
            kind,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u64(self.correlation_id.as_u64());
        dst.put_u8(self.kind.as_u8());
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown kind or oversized payload).
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate before consuming anything
        let kind_byte = src[8];
        let kind = FrameKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownFrameKind(kind_byte))?;

        let correlation_id = CorrelationId::new(src.get_u64());
        let _ = src.get_u8();
        let payload_length = src.get_u32();

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Some(Self {
            correlation_id,
            kind,
            payload_length,
        }))
    }
}
