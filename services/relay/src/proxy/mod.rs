//! Cookie-routed relay implementation.
//!
//! This module provides:
//! - Frame reading for the client stream
//! - Backend dialing with failover and retry rounds
//! - Per-connection handling and the bidirectional relay
//! - The live session registry and its metrics
//! - Listener lifecycle management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Handler -> first frame -> cookie -> Resolver
//!                          |                                   |
//!                          +------- Dialer <--- endpoints -----+
//!                          |
//!                     RelayEngine (ingress frames / egress stream / supervisor)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ConnectionRegistry, ListenerManager, RelayConfig, RelayMetrics};
//!
//! let manager = ListenerManager::new(
//!     RelayConfig::new("0.0.0.0:3389".parse()?),
//!     Arc::new(MstsHashResolver::default()),
//!     Arc::new(ConnectionRegistry::new()),
//!     Arc::new(RelayMetrics::new()),
//! );
//! manager.start().await?;
//! ```

mod dialer;
mod frame;
mod handler;
mod listener;
mod metrics;
mod registry;
mod relay;
mod session;

pub use dialer::{
    DialError, Dialer, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_PAUSE,
};
pub use frame::{
    read_first_frame, read_next_frame, routing_cookie, FrameBuf, FrameKind, COOKIE_OFFSET,
    COOKIE_TERMINATOR, TPKT_VERSION,
};
pub use handler::{ConnectionHandler, HandlerOutcome, HandlerState, RelayContext};
pub use listener::{ListenerManager, RelayConfig, DEFAULT_BACKLOG, DEFAULT_PORT};
pub use metrics::{
    Direction, Meter, MeterSnapshot, MetricsSnapshot, RelayMetrics, RelayStats,
    RelayStatsSnapshot, SessionMeters,
};
pub use registry::ConnectionRegistry;
pub use relay::{
    RelayEngine, RelaySummary, TerminationReason, DEFAULT_BUFFER_SIZE, DEFAULT_READ_TIMEOUT,
    DEFAULT_SUPERVISOR_INTERVAL,
};
pub use session::{Session, SessionId, SessionIdError, SessionInfo};
