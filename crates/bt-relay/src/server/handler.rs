//! Rendezvous handlers
//!
//! Two kinds of traffic share the `/{client_id}` namespace:
//!
//! - A WebSocket upgrade on `GET /{client_id}` opens that client's control
//!   connection. The client's first frame must be `Register` naming the same
//!   identifier; after that the connection carries `Response` frames up and
//!   `Request` frames down.
//! - Anything else under `/{client_id}` is a public call, forwarded over the
//!   client's control connection with the identifier stripped from the path.

use std::sync::Arc;

use anyhow::bail;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bt_core::{http, ClientId};
use bt_protocol::{
    decode_frame, is_valid_client_id, Frame, RequestEnvelope, ResponseEnvelope, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};

use crate::error::RelayError;
use crate::session::SessionRecord;
use crate::state::RelayState;

/// Liveness check
pub async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "pong" }))
}

/// `/{client_id}`: control connection when upgraded, otherwise a public
/// call for the client's root path
pub async fn client_root(
    State(state): State<Arc<RelayState>>,
    upgrade: Option<WebSocketUpgrade>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((client_id, _)) = split_client_path(uri.path()) else {
        return match upgrade {
            Some(_) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "Invalid client identifier" })),
            )
                .into_response(),
            None => not_found(),
        };
    };
    let client_id = ClientId::from(client_id);

    match upgrade {
        Some(ws) => {
            tracing::debug!("Control connection upgrade for {}", client_id);
            ws.max_message_size(HEADER_SIZE + MAX_PAYLOAD_SIZE)
                .max_frame_size(HEADER_SIZE + MAX_PAYLOAD_SIZE)
                .on_upgrade(move |socket| serve_control_connection(socket, client_id, state))
        }
        None => {
            let path = with_query("/", &uri);
            public_call(&state, client_id, method, path, headers, body).await
        }
    }
}

/// `/{client_id}/{path...}`: public call forwarded to the client
pub async fn client_path(
    State(state): State<Arc<RelayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((client_id, path)) = split_client_path(uri.path()) else {
        return not_found();
    };

    let client_id = ClientId::from(client_id);
    let path = with_query(path, &uri);
    public_call(&state, client_id, method, path, headers, body).await
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
        .into_response()
}

/// Split `/{client_id}/{rest}` into the identifier and `/{rest}`.
///
/// Works on the raw path so percent-encoding reaches the origin untouched.
/// Both routes take the identifier from here, and a segment that is not a
/// valid identifier (including any percent-encoded one) yields `None`.
fn split_client_path(raw: &str) -> Option<(&str, &str)> {
    let trimmed = raw.strip_prefix('/')?;
    let (client_id, rest) = match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, "/"),
    };
    if !is_valid_client_id(client_id) {
        return None;
    }
    Some((client_id, rest))
}

fn with_query(path: &str, uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

async fn public_call(
    state: &RelayState,
    client_id: ClientId,
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match forward(state, &client_id, method, path, headers, body).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                RelayError::SessionAbsent(_) => {
                    tracing::debug!("No tunnel for {}", client_id)
                }
                other => tracing::warn!("Forwarding to {} failed: {}", client_id, other),
            }
            e.into_response()
        }
    }
}

/// Forward one public call and wait for the correlated response
async fn forward(
    state: &RelayState,
    client_id: &ClientId,
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let session = state
        .registry
        .lookup(client_id)
        .ok_or_else(|| RelayError::SessionAbsent(client_id.clone()))?;

    let mut pending = session.pending.allocate()?;
    let request = RequestEnvelope {
        correlation_id: pending.id(),
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

    tracing::debug!(
        "{} {} -> {} ({})",
        request.method,
        request.path,
        client_id,
        request.correlation_id
    );

    let timeout = state.config.request_timeout;
    let exchange = async {
        session.send_request(request).await?;
        pending.recv().await
    };
    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| RelayError::RequestTimeout(timeout))??;

    into_http_response(response)
}

/// Translate a response envelope into the outward HTTP response
fn into_http_response(envelope: ResponseEnvelope) -> Result<Response, RelayError> {
    let status = StatusCode::from_u16(envelope.status)
        .map_err(|_| RelayError::InvalidResponse(format!("status code {}", envelope.status)))?;

    let mut response = Response::new(Body::from(envelope.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in envelope.headers {
        if http::is_hop_by_hop(&name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::debug!("Dropping invalid response header {:?}", name),
        }
    }

    Ok(response)
}

/// Run one control connection from registration to teardown
pub async fn serve_control_connection(
    socket: WebSocket,
    client_id: ClientId,
    state: Arc<RelayState>,
) {
    let (mut sink, mut stream) = socket.split();

    let registration = tokio::time::timeout(
        state.config.registration_timeout,
        read_registration(&mut stream),
    )
    .await;

    let announced = match registration {
        Ok(Ok(announced)) => announced,
        Ok(Err(e)) => {
            tracing::warn!("Rejected control connection for {}: {}", client_id, e);
            let _ = sink.close().await;
            return;
        }
        Err(_) => {
            tracing::warn!(
                "Control connection for {} did not register within {:?}",
                client_id,
                state.config.registration_timeout
            );
            let _ = sink.close().await;
            return;
        }
    };

    if announced != client_id {
        tracing::warn!(
            "Control connection on /{} registered as {}; closing",
            client_id,
            announced
        );
        let _ = sink.close().await;
        return;
    }

    let (frame_tx, frame_rx) = mpsc::channel(state.config.frame_buffer);
    let cancel = state.shutdown.child_token();
    let session = state
        .registry
        .register(client_id.clone(), frame_tx, cancel.clone());

    let writer = tokio::spawn(write_frames(sink, frame_rx, cancel.clone(), client_id.clone()));

    read_responses(&mut stream, &session, &cancel).await;

    cancel.cancel();
    state.registry.unregister(&client_id, session.connection_id);
    let _ = writer.await;
}

/// Wait for the `Register` frame that must open every control connection
async fn read_registration(stream: &mut SplitStream<WebSocket>) -> anyhow::Result<ClientId> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => match decode_frame(&data)? {
                Frame::Register { client_id } => return Ok(ClientId::from(client_id)),
                other => bail!("expected Register frame, got {:?}", other.kind()),
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Text(_))) => bail!("text message on control connection"),
            Some(Ok(Message::Close(_))) | None => bail!("closed before registering"),
            Some(Err(e)) => bail!("read error: {}", e),
        }
    }
}

/// Resolve pending requests from incoming `Response` frames until the
/// connection closes, faults, or is cancelled
async fn read_responses(
    stream: &mut SplitStream<WebSocket>,
    session: &SessionRecord,
    cancel: &CancellationToken,
) {
    let client_id = &session.client_id;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Control connection for {} cancelled", client_id);
                return;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(data))) => match decode_frame(&data) {
                Ok(Frame::Response(response)) => {
                    let id = response.correlation_id;
                    if session.pending.resolve(response) {
                        tracing::trace!("Resolved {} for {}", id, client_id);
                    } else {
                        tracing::debug!(
                            "Discarding response {} for {}: not pending",
                            id,
                            client_id
                        );
                    }
                }
                Ok(other) => {
                    tracing::warn!(
                        "Unexpected {:?} frame from {}; closing connection",
                        other.kind(),
                        client_id
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!("Decode fault from {}: {}; closing connection", client_id, e);
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Text(_))) => {
                tracing::warn!("Text message from {}; closing connection", client_id);
                return;
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!("Control connection for {} closed", client_id);
                return;
            }
            Some(Err(e)) => {
                tracing::warn!("Control connection for {} failed: {}", client_id, e);
                return;
            }
        }
    }
}

/// Drain the session's frame queue onto the socket
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    client_id: ClientId,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };

        if let Err(e) = sink.send(Message::Binary(bytes.to_vec())).await {
            tracing::warn!("Write to {} failed: {}", client_id, e);
            cancel.cancel();
            break;
        }
    }

    let _ = sink.close().await;
}
