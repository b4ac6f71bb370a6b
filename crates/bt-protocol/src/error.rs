//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames.
///
/// Every decode error is a fault on the control connection that produced it;
/// readers log it and tear the connection down rather than skipping frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame kind
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Incomplete frame received
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Bytes left over after a complete frame
    #[error("Trailing data after frame: {0} bytes")]
    TrailingData(usize),

    /// Payload decoded but violates the envelope schema
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
