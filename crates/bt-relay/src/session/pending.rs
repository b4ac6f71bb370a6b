//! Per-session table of requests awaiting a response
//!
//! Every public call forwarded over a control connection takes a slot here,
//! keyed by a fresh correlation id. The reader task of that connection
//! resolves slots as responses arrive, in whatever order the client
//! produces them. Slots are one-shot: a response for an id that is no longer
//! pending (already answered, timed out, or never allocated) is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use bt_protocol::{CorrelationId, ResponseEnvelope};

use crate::error::{RelayError, TeardownReason};

type WaiterResult = Result<ResponseEnvelope, TeardownReason>;

/// Correlation id → waiting caller, for one control connection
pub struct PendingRequestTable {
    /// Next correlation id to hand out
    next_id: AtomicU64,
    /// Maximum outstanding requests
    limit: usize,
    inner: Mutex<PendingInner>,
}

struct PendingInner {
    waiters: HashMap<CorrelationId, oneshot::Sender<WaiterResult>>,
    /// Set once the session is torn down; later allocations fail immediately
    closed: Option<TeardownReason>,
}

impl PendingRequestTable {
    /// Create an empty table admitting at most `limit` outstanding requests
    pub fn new(limit: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1), // 0 is CorrelationId::NONE
            limit,
            inner: Mutex::new(PendingInner {
                waiters: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a fresh correlation id and the slot its response will land in
    pub fn allocate(self: &Arc<Self>) -> Result<PendingRequest, RelayError> {
        let mut inner = self.lock();

        if let Some(reason) = inner.closed {
            return Err(reason.into());
        }
        if inner.waiters.len() >= self.limit {
            return Err(RelayError::TooManyPending { limit: self.limit });
        }

        let id = loop {
            let candidate = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            if candidate != CorrelationId::NONE && !inner.waiters.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);

        Ok(PendingRequest {
            id,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hand a response to its waiter.
    ///
    /// Returns false when nothing was waiting for this correlation id.
    pub fn resolve(&self, response: ResponseEnvelope) -> bool {
        let waiter = self.lock().waiters.remove(&response.correlation_id);
        match waiter {
            // The receiver may have just timed out; that's still a no-op
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request and refuse new ones.
    ///
    /// Returns the number of waiters that were failed.
    pub fn fail_all(&self, reason: TeardownReason) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason);
            }
            inner.waiters.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(reason));
        }
        count
    }

    /// Drop a slot without resolving it
    fn release(&self, id: CorrelationId) -> bool {
        self.lock().waiters.remove(&id).is_some()
    }

    /// Whether a correlation id is currently pending
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.lock().waiters.contains_key(&id)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Check if no requests are outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table has been torn down
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

/// A caller's claim on one slot of a [`PendingRequestTable`].
///
/// Dropping it releases the slot, so a caller that stops waiting (timeout,
/// or the public HTTP connection going away) never leaks an entry.
pub struct PendingRequest {
    id: CorrelationId,
    rx: oneshot::Receiver<WaiterResult>,
    table: Arc<PendingRequestTable>,
}

impl PendingRequest {
    /// Correlation id to put on the forwarded request
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the response or the session's teardown
    pub async fn recv(&mut self) -> Result<ResponseEnvelope, RelayError> {
        match (&mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(reason.into()),
            Err(_) => Err(RelayError::SessionDisconnected),
        }
    }

    /// Wait for the response, at most `timeout`
    pub async fn wait(&mut self, timeout: Duration) -> Result<ResponseEnvelope, RelayError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| RelayError::RequestTimeout(timeout))?
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}
