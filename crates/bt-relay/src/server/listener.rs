//! Relay listener
//!
//! Binds the public address and serves the rendezvous router until the
//! shutdown token fires.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;

use crate::server::handler;
use crate::state::RelayState;

/// Build the rendezvous router
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ping", get(handler::ping))
        .route("/:client_id", any(handler::client_root))
        .fallback(handler::client_path)
        .layer(DefaultBodyLimit::max(state.config.max_body_size))
        .with_state(state)
}

/// HTTP server accepting both public calls and control connections
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the configured address
    pub async fn bind(state: Arc<RelayState>) -> Result<Self> {
        let bind_addr = state.config.bind_address.clone();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self { listener, state })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the state's shutdown token is cancelled.
    ///
    /// On the way out every live session is torn down, so callers still
    /// waiting on a response get a 502 rather than hanging.
    pub async fn run(self) -> Result<()> {
        let local_addr = self.local_addr()?;
        tracing::info!("Relay listening on {}", local_addr);

        let shutdown = self.state.shutdown.clone();
        let registry = Arc::clone(&self.state.registry);
        let app = router(self.state);

        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("Relay shutting down");
            })
            .await;

        registry.shutdown();
        result.context("Relay server failed")
    }
}
