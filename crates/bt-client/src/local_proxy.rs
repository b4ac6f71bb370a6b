//! Local preview proxy
//!
//! Serves the origin forwarder on a loopback port so the combined
//! frontend and backend can be checked locally exactly as tunnel callers
//! will see them.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use bt_core::http;
use bt_protocol::{CorrelationId, RequestEnvelope, ResponseEnvelope};

use crate::forwarder::Origin;

/// Request body limit when none is configured; the relay's default
pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Build the proxy router; every path goes to `origin`
pub fn router(origin: Arc<dyn Origin>, body_limit: usize) -> Router {
    Router::new()
        .fallback(handle)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(origin)
}

async fn handle(
    State(origin): State<Arc<dyn Origin>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let request = RequestEnvelope {
        correlation_id: CorrelationId::NONE,
        method: method.as_str().to_string(),
        path,
        headers: http::end_to_end(headers.iter().map(|(name, value)| {
            (
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })),
        body,
    };

    into_response(origin.forward(request).await)
}

fn into_response(envelope: ResponseEnvelope) -> Response {
    let Ok(status) = StatusCode::from_u16(envelope.status) else {
        return (StatusCode::BAD_GATEWAY, "Invalid status from origin").into_response();
    };

    let mut response = Response::new(Body::from(envelope.body));
    *response.status_mut() = status;
    for (name, value) in envelope.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Loopback HTTP server in front of the origin forwarder
pub struct LocalProxy {
    listener: TcpListener,
    origin: Arc<dyn Origin>,
    body_limit: usize,
}

impl LocalProxy {
    /// Bind `127.0.0.1:{port}`
    pub async fn bind(port: u16, origin: Arc<dyn Origin>) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind local proxy to {}", addr))?;
        Ok(Self {
            listener,
            origin,
            body_limit: DEFAULT_BODY_LIMIT,
        })
    }

    /// Accept request bodies up to `limit` bytes
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Local proxy running at http://{}", self.local_addr()?);

        axum::serve(self.listener, router(self.origin, self.body_limit))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("Local proxy failed")
    }
}
