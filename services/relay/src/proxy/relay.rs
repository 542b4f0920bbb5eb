//! Bidirectional relay between a client and its backend.
//!
//! Two tasks move bytes, one per direction:
//! - ingress (client to backend) forwards whole frames, as parsed by
//!   [`read_next_frame`];
//! - egress (backend to client) copies through a fixed-size buffer.
//!
//! A supervisor polls the session's liveness flag and both tasks. When the
//! flag is cleared or either task finishes, it clears the flag, aborts both
//! tasks (dropping their socket halves) and reports why the relay stopped.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, Instrument};

use super::frame::{read_next_frame, FrameBuf};
use super::metrics::{Direction, RelayMetrics, SessionMeters};
use super::session::Session;

/// Default egress copy buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Default per-read socket timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default supervisor polling interval.
pub const DEFAULT_SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The liveness flag was cleared from outside (operator kill).
    Killed,
    /// The client stream ended or failed.
    ClientClosed,
    /// The backend stream ended or failed.
    BackendClosed,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Killed => "killed",
            Self::ClientClosed => "client_closed",
            Self::BackendClosed => "backend_closed",
        };
        f.write_str(s)
    }
}

/// Result of a completed relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub reason: TerminationReason,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Runs the two relay directions and their supervisor.
#[derive(Debug, Clone)]
pub struct RelayEngine {
    buffer_size: usize,
    read_timeout: Option<Duration>,
    supervisor_interval: Duration,
}

impl RelayEngine {
    pub fn new(
        buffer_size: usize,
        read_timeout: Option<Duration>,
        supervisor_interval: Duration,
    ) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            read_timeout,
            supervisor_interval,
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Relay until the session is killed or either side closes.
    ///
    /// Returns once both relay tasks have stopped and released their halves.
    pub async fn run<CR, CW, BR, BW>(
        &self,
        session: &Session,
        metrics: Arc<RelayMetrics>,
        client_read: CR,
        client_write: CW,
        backend_read: BR,
        backend_write: BW,
    ) -> RelaySummary
    where
        CR: AsyncRead + Unpin + Send + 'static,
        CW: AsyncWrite + Unpin + Send + 'static,
        BR: AsyncRead + Unpin + Send + 'static,
        BW: AsyncWrite + Unpin + Send + 'static,
    {
        let alive = session.liveness();

        let ingress = tokio::spawn(
            pump_frames(
                client_read,
                backend_write,
                Arc::clone(&alive),
                Arc::clone(session.meters()),
                Arc::clone(&metrics),
                self.read_timeout,
            )
            .in_current_span(),
        );
        let egress = tokio::spawn(
            pump_stream(
                backend_read,
                client_write,
                Arc::clone(&alive),
                Arc::clone(session.meters()),
                metrics,
                self.buffer_size,
                self.read_timeout,
            )
            .in_current_span(),
        );

        let reason = loop {
            if !alive.load(Ordering::Acquire) {
                break TerminationReason::Killed;
            }
            if ingress.is_finished() {
                break TerminationReason::ClientClosed;
            }
            if egress.is_finished() {
                break TerminationReason::BackendClosed;
            }
            sleep(self.supervisor_interval).await;
        };

        alive.store(false, Ordering::Release);
        ingress.abort();
        egress.abort();
        // Cancelled join results are expected here.
        let _ = ingress.await;
        let _ = egress.await;

        RelaySummary {
            reason,
            bytes_to_backend: session.meters().ingress.bytes(),
            bytes_from_backend: session.meters().egress.bytes(),
        }
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new(
            DEFAULT_BUFFER_SIZE,
            Some(DEFAULT_READ_TIMEOUT),
            DEFAULT_SUPERVISOR_INTERVAL,
        )
    }
}

/// Client to backend: forward whole frames.
async fn pump_frames<R, W>(
    mut reader: R,
    mut writer: W,
    alive: Arc<AtomicBool>,
    meters: Arc<SessionMeters>,
    metrics: Arc<RelayMetrics>,
    read_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frame = FrameBuf::new();
    let result: io::Result<()> = async {
        while alive.load(Ordering::Acquire) {
            if with_timeout(read_timeout, read_next_frame(&mut reader, &mut frame))
                .await?
                .is_none()
            {
                break;
            }

            let started = Instant::now();
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await?;
            metrics.record(Direction::Ingress, &meters, frame.len(), started.elapsed());
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!(direction = "ingress", error = %e, "Relay stream ended with error");
    }
}

/// Backend to client: copy bytes as they arrive.
async fn pump_stream<R, W>(
    mut reader: R,
    mut writer: W,
    alive: Arc<AtomicBool>,
    meters: Arc<SessionMeters>,
    metrics: Arc<RelayMetrics>,
    buffer_size: usize,
    read_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let result: io::Result<()> = async {
        while alive.load(Ordering::Acquire) {
            let n = with_timeout(read_timeout, reader.read(&mut buf)).await?;
            if n == 0 {
                break;
            }

            let started = Instant::now();
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            metrics.record(Direction::Egress, &meters, n, started.elapsed());
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!(direction = "egress", error = %e, "Relay stream ended with error");
    }
}

/// Await `fut`, failing with `TimedOut` once `limit` elapses.
pub(crate) async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        None => fut.await,
        Some(limit) => match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        },
    }
}
