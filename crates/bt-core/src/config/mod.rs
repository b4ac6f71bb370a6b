//! Configuration management for BlackTunnel

mod client;
mod relay;
pub mod serde_utils;

pub use client::{BackoffConfig, ClientConfig};
pub use relay::RelayConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blacktunnel")
}

/// Default path of the relay configuration file
pub fn default_relay_config_path() -> PathBuf {
    default_config_dir().join("relay.toml")
}

/// Default path of the client configuration file
pub fn default_client_config_path() -> PathBuf {
    default_config_dir().join("client.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}
