//! Envelope types for the BlackTunnel control protocol
//!
//! # Message Flow
//!
//! 1. Client opens the control connection and sends `Register` with its identifier
//! 2. Relay sends `Request` frames as public HTTP calls arrive
//! 3. Client answers each with a `Response` carrying the same correlation id
//!
//! Requests and responses for different correlation ids interleave freely;
//! there is no ordering between them beyond "one response per request".
//!
//! Correlation ids travel in the frame header, so they are skipped when the
//! envelope payload is serialized.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::ProtocolError;

/// Ordered header multimap. Repeated names are kept as separate entries.
pub type Headers = Vec<(String, String)>;

/// Frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client identifier, first frame on every control connection
    Register = 0x01,
    /// Forwarded HTTP request (relay → client)
    Request = 0x02,
    /// Origin response (client → relay)
    Response = 0x03,
}

impl FrameKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Response),
            _ => None,
        }
    }
}

/// An HTTP request forwarded from the relay to a tunnel client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Carried in the frame header
    #[serde(skip)]
    pub correlation_id: CorrelationId,
    /// HTTP method, e.g. "GET"
    pub method: String,
    /// Path and query, always starting with '/'
    pub path: String,
    /// Request headers
    pub headers: Headers,
    /// Raw request body
    pub body: Bytes,
}

impl RequestEnvelope {
    /// Create a request with no headers and an empty body
    pub fn new(
        correlation_id: CorrelationId,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The path without its query string
    pub fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(p, _)| p)
    }

    /// Check the envelope against the wire schema
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.correlation_id == CorrelationId::NONE {
            return Err(ProtocolError::InvalidEnvelope(
                "request without correlation id".to_string(),
            ));
        }
        if !is_token(&self.method) {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "invalid method {:?}",
                self.method
            )));
        }
        if !self.path.starts_with('/') {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "path must start with '/': {:?}",
                self.path
            )));
        }
        Ok(())
    }
}

/// The origin's answer to a forwarded request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Carried in the frame header
    #[serde(skip)]
    pub correlation_id: CorrelationId,
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Raw response body
    pub body: Bytes,
}

impl ResponseEnvelope {
    /// Create a response with no headers and an empty body
    pub fn new(correlation_id: CorrelationId, status: u16) -> Self {
        Self {
            correlation_id,
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Synthetic plain-text response for failures produced by the tunnel itself
    pub fn error(correlation_id: CorrelationId, status: u16, message: impl Into<String>) -> Self {
        Self::new(correlation_id, status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(message.into())
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Check the envelope against the wire schema
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.correlation_id == CorrelationId::NONE {
            return Err(ProtocolError::InvalidEnvelope(
                "response without correlation id".to_string(),
            ));
        }
        if !(100..=999).contains(&self.status) {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "status code out of range: {}",
                self.status
            )));
        }
        Ok(())
    }
}

/// A decoded control-connection frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client identifier announcement
    Register { client_id: String },
    /// Forwarded request
    Request(RequestEnvelope),
    /// Origin response
    Response(ResponseEnvelope),
}

impl Frame {
    /// Get the frame kind
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Register { .. } => FrameKind::Register,
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
        }
    }

    /// Correlation id carried in the header
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Frame::Register { .. } => CorrelationId::NONE,
            Frame::Request(request) => request.correlation_id,
            Frame::Response(response) => response.correlation_id,
        }
    }

    /// Check the frame against the wire schema
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Frame::Register { client_id } => {
                if !is_valid_client_id(client_id) {
                    return Err(ProtocolError::InvalidEnvelope(format!(
                        "invalid client identifier {:?}",
                        client_id
                    )));
                }
                Ok(())
            }
            Frame::Request(request) => request.validate(),
            Frame::Response(response) => response.validate(),
        }
    }
}

/// Client identifiers are non-empty runs of URL-unreserved characters
/// (`A-Z a-z 0-9 . _ ~ -`), so they read the same raw and percent-decoded.
pub fn is_valid_client_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'~' | b'-'))
}

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// RFC 9110 token: what an HTTP method is allowed to be
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_roundtrip() {
        for kind in [FrameKind::Register, FrameKind::Request, FrameKind::Response] {
            let byte = kind.as_u8();
            assert_eq!(FrameKind::from_u8(byte), Some(kind));
        }
        assert_eq!(FrameKind::from_u8(0), None);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = RequestEnvelope::new(CorrelationId::new(1), "GET", "/")
            .with_header("Accept", "text/html")
            .with_header("accept", "application/json");
        assert_eq!(request.header("ACCEPT"), Some("text/html"));
        assert_eq!(request.header("x-missing"), None);
    }

    #[test]
    fn test_path_only_strips_query() {
        let request = RequestEnvelope::new(CorrelationId::new(1), "GET", "/search?q=a/b");
        assert_eq!(request.path_only(), "/search");
    }

    #[test]
    fn test_request_validation() {
        assert!(RequestEnvelope::new(CorrelationId::new(1), "GET", "/x")
            .validate()
            .is_ok());
        assert!(RequestEnvelope::new(CorrelationId::NONE, "GET", "/x")
            .validate()
            .is_err());
        assert!(RequestEnvelope::new(CorrelationId::new(1), "GE T", "/x")
            .validate()
            .is_err());
        assert!(RequestEnvelope::new(CorrelationId::new(1), "GET", "x")
            .validate()
            .is_err());
    }

    #[test]
    fn test_response_validation() {
        assert!(ResponseEnvelope::new(CorrelationId::new(1), 200).validate().is_ok());
        assert!(ResponseEnvelope::new(CorrelationId::new(1), 42).validate().is_err());
        assert!(ResponseEnvelope::new(CorrelationId::NONE, 200).validate().is_err());
    }

    #[test]
    fn test_register_validation() {
        let ok = Frame::Register {
            client_id: "c1".to_string(),
        };
        let empty = Frame::Register {
            client_id: String::new(),
        };
        let slash = Frame::Register {
            client_id: "a/b".to_string(),
        };
        assert!(ok.validate().is_ok());
        assert!(empty.validate().is_err());
        assert!(slash.validate().is_err());

        for bad in ["a%20b", "a b", "x?y", "caf\u{e9}"] {
            let frame = Frame::Register {
                client_id: bad.to_string(),
            };
            assert!(frame.validate().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_client_id_charset() {
        assert!(is_valid_client_id("web-01.prod_A~x"));
        assert!(is_valid_client_id("4f8c2e1a-0b7d-4c3e-9a51-2d6f7e8b9c0d"));
        assert!(!is_valid_client_id(""));
        assert!(!is_valid_client_id("x%41"));
        assert!(!is_valid_client_id("a/b"));
    }

    #[test]
    fn test_error_response_is_plain_text() {
        let response = ResponseEnvelope::error(CorrelationId::new(7), 502, "origin down");
        assert_eq!(response.status, 502);
        assert_eq!(response.header("Content-Type"), Some("text/plain; charset=utf-8"));
        assert_eq!(response.body.as_ref(), b"origin down");
    }
}
