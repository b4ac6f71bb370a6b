//! bt-client: tunnel client for BlackTunnel
//!
//! The client keeps one outbound control connection open to the relay and
//! answers the requests that arrive on it from a local origin: a static
//! frontend directory and/or a backend HTTP service.

pub mod forwarder;
pub mod local_proxy;
pub mod tunnel;

pub use forwarder::{ForwardError, Origin, OriginForwarder};
pub use local_proxy::LocalProxy;
pub use tunnel::{ConnectionError, ExponentialBackoff, TunnelClient};
