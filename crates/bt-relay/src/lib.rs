//! bt-relay: public rendezvous point for BlackTunnel
//!
//! The relay accepts WebSocket control connections from tunnel clients at
//! `/{client_id}` and forwards every other call under that prefix over the
//! matching connection. Responses are correlated back to their callers by
//! the per-session pending-request table, so one connection carries any
//! number of concurrent requests.

pub mod error;
pub mod server;
pub mod session;
pub mod state;

pub use error::{RelayError, TeardownReason};
pub use server::{router, RelayServer};
pub use state::RelayState;
