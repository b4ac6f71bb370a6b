//! Outbound control connection
//!
//! Owns the connection to the relay for its whole lifecycle:
//! `Disconnected → Connecting → Registered → Serving`, and back to
//! `Disconnected` on any fault, followed by a backed-off retry. Exactly one
//! control connection exists at a time; the previous one is closed before
//! the next attempt starts.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use bt_core::config::ClientConfig;
use bt_core::{ClientId, TunnelState};
use bt_protocol::{
    decode_frame, encode_frame, Frame, FrameKind, ProtocolError, ResponseEnvelope, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};

use super::reconnect::ExponentialBackoff;
use crate::forwarder::Origin;

/// Completed responses waiting to be written to the relay.
///
/// Origin calls that finish while the writer is busy park here; when it
/// fills up they wait, which in turn slows down nothing but themselves.
const RESPONSE_CHANNEL_CAPACITY: usize = 256;

type ControlSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a control connection ended
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The relay did not accept the connection in time
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    /// Transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The relay sent something that is not a valid frame
    #[error("Decode fault: {0}")]
    Protocol(#[from] ProtocolError),

    /// A valid frame the client never expects to receive
    #[error("Unexpected {0:?} frame from relay")]
    UnexpectedFrame(FrameKind),

    /// Text messages are not part of the protocol
    #[error("Unexpected text message from relay")]
    UnexpectedText,
}

/// How a served control connection ended
struct Served {
    /// Forwarded requests received before the connection ended
    requests: u64,
    result: Result<(), ConnectionError>,
}

/// Keeps the tunnel to the relay up and serves forwarded requests
pub struct TunnelClient {
    config: ClientConfig,
    client_id: ClientId,
    origin: Arc<dyn Origin>,
    state_tx: watch::Sender<TunnelState>,
}

impl TunnelClient {
    /// Create a tunnel client answering requests with `origin`
    pub fn new(config: ClientConfig, client_id: ClientId, origin: Arc<dyn Origin>) -> Self {
        let (state_tx, _) = watch::channel(TunnelState::Disconnected);
        Self {
            config,
            client_id,
            origin,
            state_tx,
        }
    }

    /// Identifier this client registers under
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Current tunnel state
    pub fn state(&self) -> TunnelState {
        *self.state_tx.borrow()
    }

    /// Watch tunnel state transitions
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: TunnelState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Tunnel state: {} -> {}", previous, state);
        }
    }

    /// Connect, serve and reconnect until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        loop {
            self.set_state(TunnelState::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(socket) => {
                    self.set_state(TunnelState::Registered);
                    tracing::info!("Registered with relay as {}", self.client_id);

                    let started = Instant::now();
                    let served = self.serve(socket, &cancel).await;
                    match served.result {
                        Ok(()) => tracing::info!("Control connection closed"),
                        Err(e) => tracing::warn!("Control connection lost: {}", e),
                    }

                    // The relay never acknowledges a registration, so only a
                    // connection that carried traffic or stayed up for a full
                    // backoff period counts as healthy.
                    if served.requests > 0 || started.elapsed() >= self.config.backoff.max {
                        backoff.reset(self.config.backoff.initial);
                    }
                }
                Err(e) => tracing::warn!("Failed to connect to relay: {}", e),
            }

            self.set_state(TunnelState::Disconnected);
            if cancel.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(TunnelState::Disconnected);
        tracing::info!("Tunnel client stopped");
    }

    /// Open the control connection and announce our identifier
    async fn connect(&self) -> Result<ControlSocket, ConnectionError> {
        let url = self.config.control_url(&self.client_id);
        tracing::debug!("Connecting to {}", url);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(HEADER_SIZE + MAX_PAYLOAD_SIZE);
        ws_config.max_frame_size = Some(HEADER_SIZE + MAX_PAYLOAD_SIZE);

        let (mut socket, _) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async_with_config(url.as_str(), Some(ws_config), true),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(url.clone()))??;

        let register = encode_frame(Frame::Register {
            client_id: self.client_id.to_string(),
        })?;
        socket.send(Message::Binary(register.to_vec())).await?;

        Ok(socket)
    }

    /// Serve forwarded requests until the connection ends.
    ///
    /// Each request runs on its own task so a slow origin call never holds
    /// up decoding of the next frame. The result is `Ok` on an orderly close
    /// or cancellation.
    async fn serve(&self, socket: ControlSocket, cancel: &CancellationToken) -> Served {
        let (mut sink, mut stream) = socket.split();
        let (response_tx, mut response_rx) =
            mpsc::channel::<ResponseEnvelope>(RESPONSE_CHANNEL_CAPACITY);
        let mut in_flight = JoinSet::new();
        let mut requests = 0u64;

        self.set_state(TunnelState::Serving);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                Some(response) = response_rx.recv() => {
                    let bytes = match encode_response(response) {
                        Ok(bytes) => bytes,
                        Err(e) => break Err(e.into()),
                    };
                    tracing::trace!("Sending {} bytes", bytes.len());
                    if let Err(e) = sink.send(Message::Binary(bytes)).await {
                        break Err(e.into());
                    }
                }

                message = stream.next() => match message {
                    Some(Ok(Message::Binary(data))) => match decode_frame(&data) {
                        Ok(Frame::Request(request)) => {
                            requests += 1;
                            tracing::debug!(
                                "{} {} ({})",
                                request.method,
                                request.path,
                                request.correlation_id
                            );
                            let origin = Arc::clone(&self.origin);
                            let tx = response_tx.clone();
                            in_flight.spawn(async move {
                                let id = request.correlation_id;
                                let mut response = origin.forward(request).await;
                                response.correlation_id = id;
                                let _ = tx.send(response).await;
                            });
                        }
                        Ok(other) => break Err(ConnectionError::UnexpectedFrame(other.kind())),
                        Err(e) => break Err(e.into()),
                    },
                    Some(Ok(Message::Text(_))) => break Err(ConnectionError::UnexpectedText),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Request task panicked: {}", e);
                        }
                    }
                }
            }
        };

        in_flight.abort_all();
        let _ = sink.close().await;
        Served { requests, result }
    }
}

/// Encode a response, replacing it with a 502 if it cannot be framed
fn encode_response(response: ResponseEnvelope) -> Result<Vec<u8>, ProtocolError> {
    let id = response.correlation_id;
    match encode_frame(Frame::Response(response)) {
        Ok(bytes) => Ok(bytes.to_vec()),
        Err(e) => {
            tracing::warn!("Response {} could not be encoded: {}", id, e);
            let fallback =
                ResponseEnvelope::error(id, 502, format!("Response not deliverable: {}", e));
            Ok(encode_frame(Frame::Response(fallback))?.to_vec())
        }
    }
}
