//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one tunnel client on the relay.
///
/// Doubles as the first path segment of every public URL routed to that
/// client, so it may not contain '/'.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a new client ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random client ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Whether this ID can be used as a URL path segment
    pub fn is_valid(&self) -> bool {
        bt_protocol::is_valid_client_id(&self.0)
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of the tunnel client's control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    /// No control connection; waiting to (re)connect
    Disconnected,
    /// Opening the control connection
    Connecting,
    /// Connection open and client identifier sent
    Registered,
    /// Reading forwarded requests
    Serving,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Disconnected => write!(f, "disconnected"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Registered => write!(f, "registered"),
            TunnelState::Serving => write!(f, "serving"),
        }
    }
}
