//! Origin forwarder
//!
//! Executes a forwarded request against the local origin. GET and HEAD
//! requests are first matched against the static root (if any), then the
//! index document, and everything else is proxied to the backend. Failures
//! never escape as errors: they become a synthetic error response for the
//! one request that hit them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use bt_core::config::ClientConfig;
use bt_core::http;
use bt_protocol::{CorrelationId, RequestEnvelope, ResponseEnvelope};

/// Something that can answer forwarded requests
#[async_trait]
pub trait Origin: Send + Sync {
    /// Produce the response for `request`, carrying its correlation id.
    /// Never fails; local errors are reported as an error status.
    async fn forward(&self, request: RequestEnvelope) -> ResponseEnvelope;
}

/// Failures while executing a request locally
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Path resolves outside the static root
    #[error("Forbidden path: {0}")]
    Forbidden(String),

    /// Method is not a valid HTTP method
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    /// The backend could not be reached or did not answer in time
    #[error("Origin unavailable: {0}")]
    OriginUnavailable(#[from] reqwest::Error),

    /// A static file could not be read
    #[error("Failed to read static file: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    /// Status reported back through the tunnel
    pub fn status(&self) -> u16 {
        match self {
            ForwardError::Forbidden(_) => 403,
            ForwardError::InvalidMethod(_) => 400,
            ForwardError::OriginUnavailable(_) | ForwardError::Io(_) => 502,
        }
    }
}

/// Serves static files and proxies to the local backend
pub struct OriginForwarder {
    origin_url: String,
    static_root: Option<PathBuf>,
    index_document: Option<String>,
    http: reqwest::Client,
}

impl OriginForwarder {
    /// Create a forwarder proxying to `origin_url`
    pub fn new(
        origin_url: impl Into<String>,
        origin_timeout: Duration,
    ) -> Result<Self, ForwardError> {
        let http = reqwest::Client::builder()
            .timeout(origin_timeout)
            // The caller sees the backend's redirects, not their targets
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            origin_url: origin_url.into().trim_end_matches('/').to_string(),
            static_root: None,
            index_document: None,
            http,
        })
    }

    /// Create a forwarder from client configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self, ForwardError> {
        let mut forwarder = Self::new(&config.origin_url, config.origin_timeout)?;
        if let Some(root) = &config.static_root {
            forwarder = forwarder.with_static_root(root.clone(), config.index_document.clone());
        }
        Ok(forwarder)
    }

    /// Serve files from `root` ahead of the backend
    pub fn with_static_root(mut self, root: PathBuf, index_document: Option<String>) -> Self {
        self.static_root = Some(root);
        self.index_document = index_document;
        self
    }

    /// Execute `request`, reporting local failures as errors
    pub async fn try_forward(
        &self,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, ForwardError> {
        if let Some(root) = &self.static_root {
            if let Some(response) = self.serve_static(root, &request).await? {
                return Ok(response);
            }
        }

        self.proxy(request).await
    }

    /// Static match, then index fallback. `None` means fall through to the
    /// backend.
    async fn serve_static(
        &self,
        root: &Path,
        request: &RequestEnvelope,
    ) -> Result<Option<ResponseEnvelope>, ForwardError> {
        let head_only = request.method.eq_ignore_ascii_case("HEAD");
        if !head_only && !request.method.eq_ignore_ascii_case("GET") {
            return Ok(None);
        }

        let relative = static_path(request.path_only())?;
        let id = request.correlation_id;

        if let Some(response) = read_file(root, &root.join(&relative), id, head_only).await? {
            return Ok(Some(response));
        }

        if let Some(index) = &self.index_document {
            if let Some(response) = read_file(root, &root.join(index), id, head_only).await? {
                return Ok(Some(response));
            }
        }

        Ok(None)
    }

    /// Replay the request against the backend
    async fn proxy(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, ForwardError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::InvalidMethod(request.method.clone()))?;
        let url = format!("{}{}", self.origin_url, request.path);

        let mut builder = self.http.request(method, &url);
        for (name, value) in &request.headers {
            if !http::is_hop_by_hop(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let response = builder.body(request.body).send().await?;

        let status = response.status().as_u16();
        let headers = http::end_to_end(response.headers().iter().map(|(name, value)| {
            (
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        }));
        let body = response.bytes().await?;

        Ok(ResponseEnvelope {
            correlation_id: request.correlation_id,
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Origin for OriginForwarder {
    async fn forward(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let id = request.correlation_id;
        let summary = format!("{} {}", request.method, request.path);

        match self.try_forward(request).await {
            Ok(response) => {
                tracing::debug!("{} -> {} ({})", summary, response.status, id);
                response
            }
            Err(e) => {
                tracing::warn!("{} failed: {}", summary, e);
                ResponseEnvelope::error(id, e.status(), e.to_string())
            }
        }
    }
}

/// Map a request path onto a relative filesystem path, refusing anything
/// that could step outside the root
fn static_path(path: &str) -> Result<PathBuf, ForwardError> {
    let mut relative = PathBuf::new();

    for segment in path.split('/') {
        let decoded =
            urlencoding::decode(segment).map_err(|_| ForwardError::Forbidden(path.to_string()))?;

        match decoded.as_ref() {
            "" | "." => continue,
            ".." => return Err(ForwardError::Forbidden(path.to_string())),
            s if s.contains(['/', '\\', '\0']) || Path::new(s).is_absolute() => {
                return Err(ForwardError::Forbidden(path.to_string()))
            }
            s => relative.push(s),
        }
    }

    Ok(relative)
}

/// Read a regular file under `root`, or `None` if there is none at `path`
async fn read_file(
    root: &Path,
    path: &Path,
    id: CorrelationId,
    head_only: bool,
) -> Result<Option<ResponseEnvelope>, ForwardError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Ok(None),
    }

    // Symlinks inside the root must not lead out of it
    let resolved = tokio::fs::canonicalize(path).await?;
    let root = tokio::fs::canonicalize(root).await?;
    if !resolved.starts_with(&root) {
        return Err(ForwardError::Forbidden(path.display().to_string()));
    }

    let contents = tokio::fs::read(&resolved).await?;
    let response =
        ResponseEnvelope::new(id, 200).with_header("Content-Type", content_type(path));

    Ok(Some(if head_only {
        response
    } else {
        response.with_body(contents)
    }))
}

/// Content type by file extension
fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") | Some("cjs") => "text/javascript; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("webmanifest") => "application/manifest+json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        Some("csv") => "text/csv; charset=utf-8",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("bmp") => "image/bmp",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("eot") => "application/vnd.ms-fontobject",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        _ => "application/octet-stream",
    }
}
