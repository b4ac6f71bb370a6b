//! Global relay state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use bt_core::config::RelayConfig;

use crate::session::SessionRegistry;

/// State shared by every relay handler
pub struct RelayState {
    /// Configuration
    pub config: RelayConfig,
    /// Live tunnel sessions
    pub registry: Arc<SessionRegistry>,
    /// Cancelled when the relay shuts down; control connections hold
    /// child tokens
    pub shutdown: CancellationToken,
}

impl RelayState {
    /// Create new relay state
    pub fn new(config: RelayConfig) -> Self {
        Self::with_shutdown(config, CancellationToken::new())
    }

    /// Create new relay state tied to an external shutdown token
    pub fn with_shutdown(config: RelayConfig, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_pending_per_session));
        Self {
            config,
            registry,
            shutdown,
        }
    }

    /// Get the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
