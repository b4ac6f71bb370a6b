//! Tokio codec for framed protocol messages
//!
//! `FrameCodec` works on a byte stream and tolerates partial reads. The
//! control connection is message-oriented, so `decode_frame` additionally
//! requires that a message holds exactly one complete frame.

use bincode::Options;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{Frame, FrameKind, RequestEnvelope, ResponseEnvelope};
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Payload encoding: fixed-width integers, bounded allocations, no slack.
fn payload_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
        .reject_trailing_bytes()
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }

    fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Frame, ProtocolError> {
        let options = payload_options();
        let frame = match header.kind {
            FrameKind::Register => Frame::Register {
                client_id: options.deserialize(payload)?,
            },
            FrameKind::Request => {
                let mut request: RequestEnvelope = options.deserialize(payload)?;
                request.correlation_id = header.correlation_id;
                Frame::Request(request)
            }
            FrameKind::Response => {
                let mut response: ResponseEnvelope = options.deserialize(payload)?;
                response.correlation_id = header.correlation_id;
                Frame::Response(response)
            }
        };
        frame.validate()?;
        Ok(frame)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        Self::decode_payload(&header, &payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let options = payload_options();
        let payload = match &frame {
            Frame::Register { client_id } => options.serialize(client_id)?,
            Frame::Request(request) => options.serialize(request)?,
            Frame::Response(response) => options.serialize(response)?,
        };

        let payload_len = payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(frame.correlation_id(), frame.kind(), payload_len as u32);
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

/// Encode one frame into a standalone message
pub fn encode_frame(frame: Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a message that must contain exactly one frame
pub fn decode_frame(message: &[u8]) -> Result<Frame, ProtocolError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(message);

    match codec.decode(&mut buf)? {
        Some(frame) if buf.is_empty() => Ok(frame),
        Some(_) => Err(ProtocolError::TrailingData(buf.len())),
        None => {
            let expected = match codec.pending_header {
                Some(header) => HEADER_SIZE + header.payload_length as usize,
                None => HEADER_SIZE,
            };
            Err(ProtocolError::IncompleteFrame {
                expected,
                actual: message.len(),
            })
        }
    }
}
