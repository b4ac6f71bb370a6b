//! Correlation identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pairs a forwarded request with the response that answers it.
///
/// Unique among the outstanding requests of one control connection.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Create a new correlation ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Reserved for frames that are not part of a request/response pair
    /// (registration, and requests served by the local proxy).
    pub const NONE: CorrelationId = CorrelationId(0);
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
