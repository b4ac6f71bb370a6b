//! bt-core: Shared types and configuration for BlackTunnel
//!
//! This crate provides the identifiers, configuration structures and HTTP
//! header rules used by both the rendezvous relay and the tunnel client.

pub mod config;
pub mod error;
pub mod http;
pub mod types;

pub use error::ConfigError;
pub use types::{ClientId, TunnelState};
