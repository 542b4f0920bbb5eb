//! Relay statistics and per-session bandwidth meters.
//!
//! Aggregate counters live for the whole process. Per-session meters are
//! registered when a session is created and released when it terminates, so
//! the per-session namespace only ever holds live sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;

use super::session::SessionId;

/// Direction of relayed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Ingress,
    /// Backend to client.
    Egress,
}

/// Byte, write and latency accounting for one stream direction.
#[derive(Debug)]
pub struct Meter {
    bytes: AtomicU64,
    writes: AtomicU64,
    write_nanos: AtomicU64,
    started: Instant,
}

impl Meter {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_nanos: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record one write of `bytes` that took `elapsed`.
    pub fn record(&self, bytes: usize, elapsed: Duration) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let bytes = self.bytes();
        let writes = self.writes.load(Ordering::Relaxed);
        let write_nanos = self.write_nanos.load(Ordering::Relaxed);
        let secs = self.started.elapsed().as_secs_f64().max(0.001);

        MeterSnapshot {
            bytes,
            writes,
            bytes_per_sec: bytes as f64 / secs,
            avg_write_micros: if writes == 0 {
                0.0
            } else {
                write_nanos as f64 / writes as f64 / 1_000.0
            },
        }
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a [`Meter`].
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct MeterSnapshot {
    pub bytes: u64,
    pub writes: u64,
    pub bytes_per_sec: f64,
    pub avg_write_micros: f64,
}

/// Meters owned by one session's relay tasks.
#[derive(Debug, Default)]
pub struct SessionMeters {
    pub ingress: Meter,
    pub egress: Meter,
}

impl SessionMeters {
    pub fn direction(&self, direction: Direction) -> &Meter {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }
}

/// Connection-level counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections hung up on because the first frame was missing or foreign.
    pub first_frame_rejected: AtomicU64,
    /// Cookies the directory could not route.
    pub routes_missed: AtomicU64,
    /// Backend dials that succeeded.
    pub backend_connected: AtomicU64,
    /// Backend dials that exhausted every attempt.
    pub backend_failed: AtomicU64,
    /// Sessions terminated by an operator kill.
    pub sessions_killed: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RelayStatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_active: load(&self.connections_active),
            connections_closed: load(&self.connections_closed),
            first_frame_rejected: load(&self.first_frame_rejected),
            routes_missed: load(&self.routes_missed),
            backend_connected: load(&self.backend_connected),
            backend_failed: load(&self.backend_failed),
            sessions_killed: load(&self.sessions_killed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RelayStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub first_frame_rejected: u64,
    pub routes_missed: u64,
    pub backend_connected: u64,
    pub backend_failed: u64,
    pub sessions_killed: u64,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct MetricsSnapshot {
    pub stats: RelayStatsSnapshot,
    pub ingress: MeterSnapshot,
    pub egress: MeterSnapshot,
    pub live_sessions: usize,
}

type SessionMeterMap = HashMap<SessionId, Arc<SessionMeters>>;

/// Process-wide metrics: counters, aggregate meters and live session meters.
#[derive(Debug)]
pub struct RelayMetrics {
    stats: RelayStats,
    ingress: Meter,
    egress: Meter,
    sessions: ArcSwap<SessionMeterMap>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            stats: RelayStats::default(),
            ingress: Meter::new(),
            egress: Meter::new(),
            sessions: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Create the meters for a new session.
    pub fn register_session(&self, id: SessionId) -> Arc<SessionMeters> {
        let meters = Arc::new(SessionMeters::default());
        self.sessions.rcu(|current| {
            let mut next = SessionMeterMap::clone(current);
            next.insert(id, Arc::clone(&meters));
            next
        });
        meters
    }

    /// Drop a session's meters. Returns whether they were registered.
    pub fn release_session(&self, id: &SessionId) -> bool {
        let previous = self.sessions.rcu(|current| {
            let mut next = SessionMeterMap::clone(current);
            next.remove(id);
            next
        });
        previous.contains_key(id)
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<SessionMeters>> {
        self.sessions.load().get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load().len()
    }

    /// Account a relayed write against the session and the aggregate meter.
    pub fn record(
        &self,
        direction: Direction,
        session: &SessionMeters,
        bytes: usize,
        elapsed: Duration,
    ) {
        session.direction(direction).record(bytes, elapsed);
        match direction {
            Direction::Ingress => self.ingress.record(bytes, elapsed),
            Direction::Egress => self.egress.record(bytes, elapsed),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stats: self.stats.snapshot(),
            ingress: self.ingress.snapshot(),
            egress: self.egress.snapshot(),
            live_sessions: self.session_count(),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_meters_registered_and_released_once() {
        let metrics = RelayMetrics::new();
        let id = SessionId::new();

        let meters = metrics.register_session(id);
        assert!(metrics.session(&id).is_some());
        assert_eq!(metrics.session_count(), 1);

        metrics.record(Direction::Ingress, &meters, 100, Duration::from_micros(4));
        metrics.record(Direction::Egress, &meters, 40, Duration::from_micros(2));
        assert_eq!(meters.ingress.bytes(), 100);
        assert_eq!(meters.egress.bytes(), 40);

        assert!(metrics.release_session(&id));
        assert!(!metrics.release_session(&id));
        assert!(metrics.session(&id).is_none());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ingress.bytes, 100);
        assert_eq!(snapshot.egress.bytes, 40);
        assert_eq!(snapshot.live_sessions, 0);
    }

    #[test]
    fn test_meter_average_latency() {
        let meter = Meter::new();
        meter.record(10, Duration::from_micros(10));
        meter.record(10, Duration::from_micros(30));

        let snapshot = meter.snapshot();
        assert_eq!(snapshot.writes, 2);
        assert!((snapshot.avg_write_micros - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = RelayStats::default();
        stats.connections_accepted.fetch_add(2, Ordering::Relaxed);
        stats.routes_missed.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.routes_missed, 1);
        assert_eq!(snapshot.sessions_killed, 0);
    }
}
