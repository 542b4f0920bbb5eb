//! rdgate relay
//!
//! Cookie-routed relay for remote-display connections: reads the routing
//! cookie from a client's first frame, resolves it through a pluggable
//! directory, dials the backend and relays both directions until either
//! side closes or an operator kills the session.

pub mod admin;
pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::RelayError;
pub use proxy::{
    ConnectionRegistry, ListenerManager, RelayConfig, RelayMetrics, SessionId, SessionInfo,
};
