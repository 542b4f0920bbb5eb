//! Public listener lifecycle and the accept loop.
//!
//! The manager owns at most one bound server socket at a time. `start` and
//! `stop` may be called repeatedly (from the operator API, for instance);
//! stopping the listener never touches sessions that are already relaying.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdgate_directory::EndpointResolver;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::dialer::{Dialer, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_PAUSE};
use super::handler::{ConnectionHandler, RelayContext};
use super::metrics::RelayMetrics;
use super::registry::ConnectionRegistry;
use super::relay::{
    RelayEngine, DEFAULT_BUFFER_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_SUPERVISOR_INTERVAL,
};
use crate::error::{RelayError, Result};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 100;

/// Default relay port.
pub const DEFAULT_PORT: u16 = 3389;

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Relay listener and session tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Listen backlog.
    pub backlog: u32,
    /// Egress copy buffer size.
    pub buffer_size: usize,
    /// Timeout for a single backend connect attempt.
    pub connect_timeout: Duration,
    /// Per-read timeout on client and backend sockets; `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Dial rounds before giving up on a backend.
    pub max_connect_attempts: u32,
    /// Pause after a fully failed dial round.
    pub connect_retry_pause: Duration,
    /// Supervisor polling interval.
    pub supervisor_interval: Duration,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            backlog: DEFAULT_BACKLOG,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            max_connect_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_retry_pause: DEFAULT_RETRY_PAUSE,
            supervisor_interval: DEFAULT_SUPERVISOR_INTERVAL,
        }
    }

    pub fn dialer(&self) -> Dialer {
        Dialer::new(
            self.connect_timeout,
            self.max_connect_attempts,
            self.connect_retry_pause,
        )
    }

    pub fn engine(&self) -> RelayEngine {
        RelayEngine::new(
            self.buffer_size,
            self.read_timeout,
            self.supervisor_interval,
        )
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))
    }
}

struct ActiveListener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Starts and stops the public listener.
pub struct ListenerManager {
    ctx: RelayContext,
    bind_addr: SocketAddr,
    backlog: u32,
    listening: AtomicBool,
    active: Mutex<Option<ActiveListener>>,
}

impl ListenerManager {
    pub fn new(
        config: RelayConfig,
        resolver: Arc<dyn EndpointResolver>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            ctx: RelayContext {
                resolver,
                dialer: config.dialer(),
                engine: config.engine(),
                registry,
                metrics,
            },
            bind_addr: config.bind_addr,
            backlog: config.backlog,
            listening: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.ctx.metrics
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Address of the bound server socket, if listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().await.as_ref().map(|a| a.local_addr)
    }

    /// Bind and start accepting. Returns the bound address.
    ///
    /// Calling `start` while already listening returns the current address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            debug!(bind_addr = %current.local_addr, "Listener already running");
            return Ok(current.local_addr);
        }

        let listener = self.bind().map_err(|source| RelayError::Bind {
            addr: self.bind_addr,
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, self.ctx.clone(), shutdown_rx));
        *active = Some(ActiveListener {
            local_addr,
            shutdown,
            task,
        });
        self.listening.store(true, Ordering::Release);

        info!(bind_addr = %local_addr, backlog = self.backlog, "Listener started");
        Ok(local_addr)
    }

    /// Close the server socket. Returns whether a listener was running.
    pub async fn stop(&self) -> bool {
        let Some(current) = self.active.lock().await.take() else {
            debug!("Listener not running");
            return false;
        };
        self.listening.store(false, Ordering::Release);

        // The accept loop may already have exited.
        let _ = current.shutdown.send(());
        if let Err(e) = current.task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        info!(bind_addr = %current.local_addr, "Listener stopped");
        true
    }

    fn bind(&self) -> std::io::Result<TcpListener> {
        let socket = match self.bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.bind_addr)?;
        socket.listen(self.backlog)
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: RelayContext,
    mut shutdown: oneshot::Receiver<()>,
) {
    let metrics = Arc::clone(&ctx.metrics);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Accept loop shutting down");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let stats = metrics.stats();
                stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                stats.connections_active.fetch_add(1, Ordering::Relaxed);

                let handler = ConnectionHandler::new(peer_addr, ctx.clone());
                let metrics = Arc::clone(&metrics);

                tokio::spawn(
                    async move {
                        match handler.handle(stream).await {
                            Ok(outcome) => debug!(?outcome, "Connection finished"),
                            Err(RelayError::Dial(e)) => {
                                warn!(error = %e, "Connection dropped: no backend reachable");
                            }
                            Err(e) => debug!(error = %e, "Connection error"),
                        }

                        let stats = metrics.stats();
                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    }
                    .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                );
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
