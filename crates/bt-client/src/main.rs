//! BlackTunnel client daemon
//!
//! Keeps a control connection open to the relay and answers forwarded
//! requests from a local backend and/or a static frontend directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bt_client::{LocalProxy, Origin, OriginForwarder, TunnelClient};
use bt_core::config::{self, ClientConfig};

#[derive(Parser)]
#[command(name = "bt-client")]
#[command(about = "BlackTunnel client - exposes a local service through a relay")]
#[command(version)]
struct Args {
    /// Relay URL (e.g. ws://relay.example:8000)
    #[arg(short, long, env = "BT_RELAY_URL")]
    tunnel: Option<String>,

    /// Local backend URL (e.g. http://localhost:5000)
    #[arg(short, long)]
    backend: Option<String>,

    /// Static frontend directory served ahead of the backend
    #[arg(long)]
    frontend: Option<PathBuf>,

    /// Document served for frontend paths with no matching file
    #[arg(long, default_value = "index.html")]
    index: String,

    /// Local proxy port
    #[arg(short, long, default_value_t = 3333)]
    port: u16,

    /// Do not start the local proxy
    #[arg(long)]
    no_local_proxy: bool,

    /// Client identifier (random when unset)
    #[arg(long)]
    client_id: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("BlackTunnel client starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_client_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        ClientConfig::default()
    };

    // Apply command-line overrides
    if let Some(tunnel) = args.tunnel {
        config.relay_url = tunnel;
    }
    if let Some(backend) = args.backend {
        config.origin_url = backend;
    }
    if let Some(frontend) = args.frontend {
        config.static_root = Some(frontend);
    }
    if config.static_root.is_some() && config.index_document.is_none() {
        config.index_document = Some(args.index);
    }
    if let Some(client_id) = args.client_id {
        config.client_id = Some(client_id);
    }
    if args.no_local_proxy {
        config.local_proxy_port = None;
    } else if config.local_proxy_port.is_none() {
        config.local_proxy_port = Some(args.port);
    }

    let client_id = config.resolve_client_id();
    if !client_id.is_valid() {
        anyhow::bail!(
            "Invalid client ID {:?}: use only letters, digits, '.', '_', '~' and '-'",
            client_id.as_str()
        );
    }

    tracing::info!("Client ID: {}", client_id);
    tracing::info!("Backend: {}", config.origin_url);
    if let Some(root) = &config.static_root {
        tracing::info!("Serving frontend from {:?}", root);
    }
    tracing::info!("Relay: {}", config.relay_url);
    tracing::info!("Public URL: {}", config.public_url(&client_id));

    let origin: Arc<dyn Origin> = Arc::new(
        OriginForwarder::from_config(&config).context("Failed to create origin forwarder")?,
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let proxy_task = match config.local_proxy_port {
        Some(port) => {
            let proxy = LocalProxy::bind(port, Arc::clone(&origin))
                .await?
                .with_body_limit(config.max_body_size);
            Some(tokio::spawn(proxy.run(cancel.clone())))
        }
        None => None,
    };

    let client = TunnelClient::new(config, client_id, origin);
    client.run(cancel.clone()).await;

    if let Some(task) = proxy_task {
        cancel.cancel();
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("{:#}", e),
            Err(e) => tracing::warn!("Local proxy task failed: {}", e),
        }
    }

    tracing::info!("Client shutdown complete");
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
