//! Directory link: registration, claim instructions and reconnects

mod connector;
mod reconnect;

pub use connector::{ActiveTunnel, ConnectionError, TunnelConnector, TunnelEvent};
pub use reconnect::ExponentialBackoff;
