//! Session tracking: live control connections and their in-flight requests

mod pending;
mod registry;

pub use pending::{PendingRequest, PendingRequestTable};
pub use registry::{ConnectionId, SessionRecord, SessionRegistry};
