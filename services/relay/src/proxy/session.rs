//! Live proxied sessions.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rdgate_directory::Endpoint;
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use super::metrics::{MeterSnapshot, SessionMeters};

/// Errors parsing a [`SessionId`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id must start with '{}_'", SessionId::PREFIX)]
    InvalidPrefix,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

/// Session identifier, formatted as `sess_{ulid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(Ulid);

impl SessionId {
    pub const PREFIX: &'static str = "sess";

    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, SessionIdError> {
        let ulid = s
            .strip_prefix(Self::PREFIX)
            .and_then(|rest| rest.strip_prefix('_'))
            .ok_or(SessionIdError::InvalidPrefix)?;

        ulid.parse::<Ulid>()
            .map(Self)
            .map_err(|e| SessionIdError::InvalidUlid(e.to_string()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// One active client-to-backend relay.
///
/// The liveness flag is the only mutable shared state: it starts `true` and
/// is only ever cleared, by the supervisor or by an operator kill.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    cookie: String,
    client: SocketAddr,
    backend: Endpoint,
    started_at: DateTime<Utc>,
    started: Instant,
    alive: Arc<AtomicBool>,
    meters: Arc<SessionMeters>,
}

impl Session {
    pub fn new(
        id: SessionId,
        cookie: String,
        client: SocketAddr,
        backend: Endpoint,
        meters: Arc<SessionMeters>,
    ) -> Self {
        Self {
            id,
            cookie,
            client,
            backend,
            started_at: Utc::now(),
            started: Instant::now(),
            alive: Arc::new(AtomicBool::new(true)),
            meters,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn backend(&self) -> Endpoint {
        self.backend
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Clear the liveness flag. Returns whether the session was alive.
    pub fn kill(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Shared liveness flag handed to the relay tasks.
    pub fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    pub fn meters(&self) -> &Arc<SessionMeters> {
        &self.meters
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            cookie: self.cookie.clone(),
            client: self.client.to_string(),
            backend: self.backend.to_string(),
            started_at: self.started_at.to_rfc3339(),
            age_secs: self.age().as_secs(),
            alive: self.is_alive(),
            ingress: self.meters.ingress.snapshot(),
            egress: self.meters.egress.snapshot(),
        }
    }
}

/// Serializable listing entry for a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub cookie: String,
    pub client: String,
    pub backend: String,
    pub started_at: String,
    pub age_secs: u64,
    pub alive: bool,
    pub ingress: MeterSnapshot,
    pub egress: MeterSnapshot,
}
