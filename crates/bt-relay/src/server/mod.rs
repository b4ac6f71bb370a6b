//! Rendezvous HTTP/WebSocket server

mod handler;
mod listener;

pub use handler::serve_control_connection;
pub use listener::{router, RelayServer};
