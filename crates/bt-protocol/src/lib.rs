//! bt-protocol: Wire protocol for BlackTunnel
//!
//! This crate defines the binary frames exchanged between the rendezvous
//! relay and tunnel clients over the control connection. Each WebSocket
//! binary message carries exactly one frame.

pub mod codec;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod frame;

pub use codec::{decode_frame, encode_frame, FrameCodec};
pub use correlation::CorrelationId;
pub use envelope::{
    is_valid_client_id, Frame, FrameKind, Headers, RequestEnvelope, ResponseEnvelope,
};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
