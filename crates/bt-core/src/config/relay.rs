//! Relay configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the rendezvous relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind the public HTTP server to
    pub bind_address: String,

    /// How long a public call waits for the tunnel client's response
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// How long a new control connection may take to send its Register frame
    #[serde(with = "duration_secs")]
    pub registration_timeout: Duration,

    /// Outstanding forwarded requests allowed per session before new
    /// calls are rejected with 503
    pub max_pending_per_session: usize,

    /// Largest public request body accepted, in bytes. Must leave room for
    /// headers within `bt_protocol::MAX_PAYLOAD_SIZE`.
    pub max_body_size: usize,

    /// Frames buffered per control connection before writers wait
    pub frame_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            request_timeout: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(10),
            max_pending_per_session: 256,
            max_body_size: 16 * 1024 * 1024,
            frame_buffer: 256,
        }
    }
}
