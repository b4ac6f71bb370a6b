//! Registry of live tunnel sessions
//!
//! Maps each client identifier to the one control connection currently
//! serving it. Lookups run concurrently; mutations are serialized per
//! identifier by the map's shard locks, which is what makes replacement and
//! conditional removal atomic with respect to each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bt_core::ClientId;
use bt_protocol::{encode_frame, Frame, RequestEnvelope};

use crate::error::{RelayError, TeardownReason};
use crate::session::pending::PendingRequestTable;

/// Identifies one accepted control connection, distinct across reconnects
/// of the same client
pub type ConnectionId = u64;

/// One registered control connection and its outstanding requests
pub struct SessionRecord {
    /// Client this session serves
    pub client_id: ClientId,
    /// Connection that registered it
    pub connection_id: ConnectionId,
    /// Requests awaiting a response on this connection
    pub pending: Arc<PendingRequestTable>,
    /// Encoded frames queued for the connection's writer task
    frames: mpsc::Sender<Bytes>,
    /// Cancelled on teardown to stop the connection's tasks
    cancel: CancellationToken,
    /// When the session was registered
    registered_at: Instant,
}

impl SessionRecord {
    /// Queue a request for delivery to the tunnel client.
    ///
    /// Encoding happens here so an oversized request fails its own caller
    /// instead of the connection.
    pub async fn send_request(&self, request: RequestEnvelope) -> Result<(), RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::SessionDisconnected);
        }
        let bytes = encode_frame(Frame::Request(request))?;
        self.frames
            .send(bytes)
            .await
            .map_err(|_| RelayError::SessionDisconnected)
    }

    /// Fail all pending requests and stop the connection's tasks.
    ///
    /// Idempotent; returns how many requests were failed by this call.
    pub fn teardown(&self, reason: TeardownReason) -> usize {
        self.cancel.cancel();
        self.pending.fail_all(reason)
    }

    /// Whether the session has been torn down
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time since registration
    pub fn uptime(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Live sessions indexed by client identifier
pub struct SessionRegistry {
    sessions: DashMap<ClientId, Arc<SessionRecord>>,
    next_connection_id: AtomicU64,
    /// Pending-request limit given to every new session
    max_pending_per_session: usize,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(max_pending_per_session: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            max_pending_per_session,
        }
    }

    /// Install a session for `client_id`, replacing any previous one.
    ///
    /// The previous session, if any, is torn down with
    /// [`TeardownReason::Replaced`] before the new record becomes visible.
    pub fn register(
        &self,
        client_id: ClientId,
        frames: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Arc<SessionRecord> {
        let record = Arc::new(SessionRecord {
            client_id: client_id.clone(),
            connection_id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            pending: Arc::new(PendingRequestTable::new(self.max_pending_per_session)),
            frames,
            cancel,
            registered_at: Instant::now(),
        });

        match self.sessions.entry(client_id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get();
                let failed = previous.teardown(TeardownReason::Replaced);
                tracing::info!(
                    "Session {} replaced (connection {} -> {}, {} pending requests failed)",
                    record.client_id,
                    previous.connection_id,
                    record.connection_id,
                    failed
                );
                entry.insert(Arc::clone(&record));
            }
            Entry::Vacant(entry) => {
                tracing::info!(
                    "Session {} registered (connection {})",
                    record.client_id,
                    record.connection_id
                );
                entry.insert(Arc::clone(&record));
            }
        }

        record
    }

    /// Get the live session for a client
    pub fn lookup(&self, client_id: &ClientId) -> Option<Arc<SessionRecord>> {
        self.sessions.get(client_id).map(|r| Arc::clone(&r))
    }

    /// Remove the session for `client_id` if it still belongs to
    /// `connection_id`, failing its pending requests.
    ///
    /// Returns the removed record; `None` means a newer connection has
    /// already replaced it (and torn it down).
    pub fn unregister(
        &self,
        client_id: &ClientId,
        connection_id: ConnectionId,
    ) -> Option<Arc<SessionRecord>> {
        let (_, record) = self
            .sessions
            .remove_if(client_id, |_, record| record.connection_id == connection_id)?;

        let failed = record.teardown(TeardownReason::Disconnected);
        tracing::info!(
            "Session {} unregistered after {:?} ({} pending requests failed)",
            client_id,
            record.uptime(),
            failed
        );
        Some(record)
    }

    /// Tear down every session (relay shutdown)
    pub fn shutdown(&self) {
        let ids: Vec<ClientId> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            if let Some((_, record)) = self.sessions.remove(&id) {
                record.teardown(TeardownReason::Disconnected);
            }
        }
    }

    /// List all sessions
    pub fn list(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        registry: &SessionRegistry,
        id: &str,
    ) -> (Arc<SessionRecord>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        let record = registry.register(ClientId::from(id), tx, CancellationToken::new());
        (record, rx)
    }

    #[test]
    fn test_lookup_absent_is_none() {
        let registry = SessionRegistry::default();
        assert!(registry.lookup(&ClientId::from("nobody")).is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = SessionRegistry::default();
        let (first, _rx1) = register(&registry, "c1");
        let (second, _rx2) = register(&registry, "c1");

        let found = registry.lookup(&ClientId::from("c1")).unwrap();
        assert_eq!(found.connection_id, second.connection_id);
        assert_ne!(first.connection_id, second.connection_id);
        assert_eq!(registry.len(), 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_replacement_fails_old_pending_requests() {
        let registry = SessionRegistry::default();
        let (first, _rx1) = register(&registry, "c1");
        let mut waiting = first.pending.allocate().unwrap();

        let (_second, _rx2) = register(&registry, "c1");

        let result = waiting.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RelayError::SessionReplaced)));
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let registry = SessionRegistry::default();
        let (first, _rx1) = register(&registry, "c1");
        let (second, _rx2) = register(&registry, "c1");

        assert!(registry
            .unregister(&ClientId::from("c1"), first.connection_id)
            .is_none());
        let found = registry.lookup(&ClientId::from("c1")).unwrap();
        assert_eq!(found.connection_id, second.connection_id);
    }

    #[tokio::test]
    async fn test_unregister_fails_pending_with_disconnect() {
        let registry = SessionRegistry::default();
        let (record, _rx) = register(&registry, "c1");
        let mut waiting = record.pending.allocate().unwrap();

        let removed = registry
            .unregister(&ClientId::from("c1"), record.connection_id)
            .unwrap();
        assert_eq!(removed.connection_id, record.connection_id);
        assert!(registry.is_empty());

        let result = waiting.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RelayError::SessionDisconnected)));
    }

    #[tokio::test]
    async fn test_send_request_reaches_writer_queue() {
        let registry = SessionRegistry::default();
        let (record, mut rx) = register(&registry, "c1");

        let request = RequestEnvelope::new(bt_protocol::CorrelationId::new(1), "GET", "/ping");
        record.send_request(request.clone()).await.unwrap();

        let bytes = rx.recv().await.unwrap();
        assert_eq!(
            bt_protocol::decode_frame(&bytes).unwrap(),
            Frame::Request(request)
        );
    }

    #[tokio::test]
    async fn test_send_after_teardown_fails() {
        let registry = SessionRegistry::default();
        let (record, _rx) = register(&registry, "c1");
        record.teardown(TeardownReason::Disconnected);

        let request = RequestEnvelope::new(bt_protocol::CorrelationId::new(1), "GET", "/");
        assert!(matches!(
            record.send_request(request).await,
            Err(RelayError::SessionDisconnected)
        ));
    }

    #[test]
    fn test_shutdown_tears_down_everything() {
        let registry = SessionRegistry::default();
        let (a, _rx1) = register(&registry, "a");
        let (b, _rx2) = register(&registry, "b");

        registry.shutdown();

        assert!(registry.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }
}
