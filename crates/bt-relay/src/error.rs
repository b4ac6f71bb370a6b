//! Relay error types and their HTTP translation

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use bt_core::ClientId;
use bt_protocol::ProtocolError;

/// Why a session's pending requests were failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// A newer control connection registered under the same identifier
    Replaced,
    /// The control connection closed or faulted
    Disconnected,
}

/// Errors surfaced to public callers
#[derive(Error, Debug)]
pub enum RelayError {
    /// No live control connection for this identifier
    #[error("Tunnel not active")]
    SessionAbsent(ClientId),

    /// Too many outstanding requests on one session
    #[error("Too many requests in flight for this tunnel (limit {limit})")]
    TooManyPending { limit: usize },

    /// The session was replaced while the request was pending
    #[error("Tunnel session was replaced by a new connection")]
    SessionReplaced,

    /// The session went away while the request was pending
    #[error("Tunnel client disconnected")]
    SessionDisconnected,

    /// The tunnel client did not answer in time
    #[error("Tunnel client did not respond within {0:?}")]
    RequestTimeout(Duration),

    /// The tunnel client's response cannot be expressed as HTTP
    #[error("Invalid response from tunnel client: {0}")]
    InvalidResponse(String),

    /// The forwarded request could not be encoded
    #[error("Failed to encode forwarded request: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<TeardownReason> for RelayError {
    fn from(reason: TeardownReason) -> Self {
        match reason {
            TeardownReason::Replaced => RelayError::SessionReplaced,
            TeardownReason::Disconnected => RelayError::SessionDisconnected,
        }
    }
}

impl RelayError {
    /// HTTP status reported to the public caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::SessionAbsent(_) => StatusCode::NOT_FOUND,
            RelayError::TooManyPending { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::SessionReplaced
            | RelayError::SessionDisconnected
            | RelayError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            RelayError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Protocol(ProtocolError::PayloadTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            RelayError::Protocol(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
