//! Tunnel client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::types::ClientId;

/// Configuration for the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL (`ws://`, `wss://`, `http://` or `https://`)
    pub relay_url: String,

    /// Client identifier. A random one is generated at startup when unset.
    pub client_id: Option<String>,

    /// Base URL of the local backend that forwarded requests are proxied to
    pub origin_url: String,

    /// Directory of static frontend files served ahead of the backend
    pub static_root: Option<PathBuf>,

    /// File under `static_root` served for GET/HEAD paths with no matching file
    pub index_document: Option<String>,

    /// Port for the local preview proxy on 127.0.0.1 (disabled when unset)
    pub local_proxy_port: Option<u16>,

    /// Largest request body the local proxy accepts, matching the relay's
    /// default limit
    pub max_body_size: usize,

    /// Timeout for one call to the backend
    #[serde(with = "duration_secs")]
    pub origin_timeout: Duration,

    /// Timeout for opening the control connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8000".to_string(),
            client_id: None,
            origin_url: "http://localhost:5000".to_string(),
            static_root: None,
            index_document: None,
            local_proxy_port: None,
            max_body_size: 16 * 1024 * 1024,
            origin_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// The configured client ID, or a freshly generated one
    pub fn resolve_client_id(&self) -> ClientId {
        self.client_id
            .as_deref()
            .map(ClientId::from)
            .unwrap_or_else(ClientId::generate)
    }

    /// WebSocket URL of the control endpoint for `client_id`
    pub fn control_url(&self, client_id: &ClientId) -> String {
        let base = self.relay_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/{}", base, client_id)
    }

    /// Public URL prefix under which the relay exposes this client
    pub fn public_url(&self, client_id: &ClientId) -> String {
        let base = self.relay_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/{}/", base, client_id)
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
