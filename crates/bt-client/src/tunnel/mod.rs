//! Control connection to the relay

mod connector;
mod reconnect;

pub use connector::{ConnectionError, TunnelClient};
pub use reconnect::ExponentialBackoff;
