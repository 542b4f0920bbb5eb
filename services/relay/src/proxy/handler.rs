//! Per-connection handling from accept to teardown.
//!
//! A handler walks one client connection through a strictly sequential
//! state machine:
//!
//! ```text
//! Accepted -> Configuring -> AwaitingFirstFrame -> CookieExtracted -> Resolving
//!          -> Dialing -> Handshaking -> Relaying -> Terminated
//! ```
//!
//! Any failure jumps straight to `Terminated`. Resources are released in
//! reverse order of acquisition: the backend and client sockets first, then
//! the directory session handle, then the registry entry and its meters.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rdgate_directory::EndpointResolver;
use socket2::SockRef;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use super::dialer::Dialer;
use super::frame::{read_first_frame, routing_cookie, FrameBuf};
use super::metrics::RelayMetrics;
use super::registry::ConnectionRegistry;
use super::relay::{with_timeout, RelayEngine, RelaySummary, TerminationReason};
use super::session::{Session, SessionId};
use crate::error::{RelayError, Result};

/// Handler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Accepted,
    Configuring,
    AwaitingFirstFrame,
    CookieExtracted,
    Resolving,
    Dialing,
    Handshaking,
    Relaying,
    Terminated,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::Configuring => "configuring",
            Self::AwaitingFirstFrame => "awaiting_first_frame",
            Self::CookieExtracted => "cookie_extracted",
            Self::Resolving => "resolving",
            Self::Dialing => "dialing",
            Self::Handshaking => "handshaking",
            Self::Relaying => "relaying",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// How a handled connection ended, when it ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The client closed or sent something other than a TPKT first frame.
    NoFirstFrame,
    /// The directory had no endpoints for the cookie.
    NoRoute { cookie: String },
    /// The connection was relayed until one side closed or it was killed.
    Relayed(RelaySummary),
}

/// Shared collaborators for every connection handler.
#[derive(Clone)]
pub struct RelayContext {
    pub resolver: Arc<dyn EndpointResolver>,
    pub dialer: Dialer,
    pub engine: RelayEngine,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Arc<RelayMetrics>,
}

impl fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayContext")
            .field("dialer", &self.dialer)
            .field("engine", &self.engine)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Releases a session's meters and removes it from the registry on drop.
struct RegisteredSession {
    id: SessionId,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
}

impl Drop for RegisteredSession {
    fn drop(&mut self) {
        self.metrics.release_session(&self.id);
        self.registry.remove(&self.id);
    }
}

/// Drives one client connection.
pub struct ConnectionHandler {
    peer_addr: SocketAddr,
    state: HandlerState,
    ctx: RelayContext,
}

impl ConnectionHandler {
    pub fn new(peer_addr: SocketAddr, ctx: RelayContext) -> Self {
        Self {
            peer_addr,
            state: HandlerState::Accepted,
            ctx,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    fn transition(&mut self, next: HandlerState) {
        trace!(from = %self.state, to = %next, "Handler state change");
        self.state = next;
    }

    /// Handle the connection until it terminates.
    pub async fn handle(mut self, client: TcpStream) -> Result<HandlerOutcome> {
        let result = self.run(client).await;
        self.transition(HandlerState::Terminated);
        result
    }

    async fn run(&mut self, client: TcpStream) -> Result<HandlerOutcome> {
        let metrics = Arc::clone(&self.ctx.metrics);
        let stats = metrics.stats();
        let read_timeout = self.ctx.engine.read_timeout();

        self.transition(HandlerState::Configuring);
        client.set_nodelay(true)?;
        SockRef::from(&client).set_keepalive(true)?;
        let (client_read, client_write) = client.into_split();
        let mut client_read = BufReader::new(client_read);

        self.transition(HandlerState::AwaitingFirstFrame);
        let mut first = FrameBuf::new();
        let parsed = with_timeout(read_timeout, read_first_frame(&mut client_read, &mut first))
            .await
            .inspect_err(|_| {
                stats.first_frame_rejected.fetch_add(1, Ordering::Relaxed);
            })?;
        if parsed.is_none() {
            stats.first_frame_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(peer_addr = %self.peer_addr, "No usable first frame");
            return Ok(HandlerOutcome::NoFirstFrame);
        }

        self.transition(HandlerState::CookieExtracted);
        let cookie = routing_cookie(first.as_bytes());
        debug!(cookie = %cookie, frame_len = first.len(), "Routing cookie extracted");

        self.transition(HandlerState::Resolving);
        let candidates = match self.ctx.resolver.resolve(&cookie).await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                stats.routes_missed.fetch_add(1, Ordering::Relaxed);
                info!(cookie = %cookie, "No route for cookie");
                return Ok(HandlerOutcome::NoRoute { cookie });
            }
            Err(e) => {
                stats.routes_missed.fetch_add(1, Ordering::Relaxed);
                info!(cookie = %cookie, error = %e, "Cookie resolution failed");
                return Ok(HandlerOutcome::NoRoute { cookie });
            }
        };
        let directory_session = self.ctx.resolver.open_session(&cookie).await?;

        self.transition(HandlerState::Dialing);
        let (backend, endpoint) = match self.ctx.dialer.connect(&candidates).await {
            Ok(connected) => {
                stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                connected
            }
            Err(e) => {
                stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let id = SessionId::new();
        let meters = metrics.register_session(id);
        let session = Arc::new(Session::new(id, cookie, self.peer_addr, endpoint, meters));
        self.ctx.registry.put(Arc::clone(&session));
        let registration = RegisteredSession {
            id,
            registry: Arc::clone(&self.ctx.registry),
            metrics: Arc::clone(&metrics),
        };
        info!(
            session_id = %id,
            cookie = %session.cookie(),
            backend = %endpoint,
            "Session established"
        );

        self.transition(HandlerState::Handshaking);
        let (backend_read, mut backend_write) = backend.into_split();
        backend_write
            .write_all(first.as_bytes())
            .await
            .map_err(RelayError::Handshake)?;
        backend_write.flush().await.map_err(RelayError::Handshake)?;

        self.transition(HandlerState::Relaying);
        let summary = self
            .ctx
            .engine
            .run(
                &session,
                Arc::clone(&metrics),
                client_read,
                client_write,
                backend_read,
                backend_write,
            )
            .await;

        if summary.reason == TerminationReason::Killed {
            stats.sessions_killed.fetch_add(1, Ordering::Relaxed);
            info!(
                session_id = %id,
                bytes_to_backend = summary.bytes_to_backend,
                bytes_from_backend = summary.bytes_from_backend,
                "Session terminated by kill"
            );
        } else {
            info!(
                session_id = %id,
                reason = %summary.reason,
                bytes_to_backend = summary.bytes_to_backend,
                bytes_from_backend = summary.bytes_from_backend,
                "Session closed"
            );
        }

        directory_session.close();
        drop(registration);
        Ok(HandlerOutcome::Relayed(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rdgate_directory::{DirectoryError, Endpoint, SessionHandle};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct FixedResolver {
        endpoints: Vec<Endpoint>,
        closed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl EndpointResolver for FixedResolver {
        async fn resolve(&self, _cookie: &str) -> std::result::Result<Vec<Endpoint>, DirectoryError> {
            Ok(self.endpoints.clone())
        }

        async fn open_session(
            &self,
            _cookie: &str,
        ) -> std::result::Result<SessionHandle, DirectoryError> {
            let closed = Arc::clone(&self.closed);
            Ok(SessionHandle::new(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn context(endpoints: Vec<Endpoint>, closed: Arc<AtomicU32>) -> RelayContext {
        RelayContext {
            resolver: Arc::new(FixedResolver { endpoints, closed }),
            dialer: Dialer::new(Duration::from_secs(1), 1, Duration::ZERO),
            engine: RelayEngine::new(1024, None, Duration::from_millis(10)),
            registry: Arc::new(ConnectionRegistry::new()),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    /// Accept one client connection on loopback and hand it to `handler`.
    async fn accept_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        (client, accepted, peer)
    }

    #[tokio::test]
    async fn test_non_tpkt_first_frame_is_rejected() {
        let ctx = context(Vec::new(), Arc::new(AtomicU32::new(0)));
        let metrics = Arc::clone(&ctx.metrics);
        let (mut client, accepted, peer) = accept_pair().await;

        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();
        let outcome = ConnectionHandler::new(peer, ctx)
            .handle(accepted)
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::NoFirstFrame);
        assert_eq!(metrics.stats().snapshot().first_frame_rejected, 1);
    }

    #[tokio::test]
    async fn test_unroutable_cookie() {
        let ctx = context(Vec::new(), Arc::new(AtomicU32::new(0)));
        let (mut client, accepted, peer) = accept_pair().await;

        let mut frame = vec![0x03, 0x00, 0x00, 0x00, 0x00, 0xE0, 0, 0, 0, 0, 0];
        frame.extend_from_slice(b"Cookie: mstshash=nowhere\r\n");
        let len = frame.len() as u16;
        frame[2..4].copy_from_slice(&len.to_be_bytes());
        client.write_all(&frame).await.unwrap();

        let outcome = ConnectionHandler::new(peer, ctx)
            .handle(accepted)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            HandlerOutcome::NoRoute {
                cookie: "Cookie: mstshash=nowhere".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_relayed_session_is_torn_down() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let closed = Arc::new(AtomicU32::new(0));
        let ctx = context(vec![Endpoint::new(backend_addr)], Arc::clone(&closed));
        let registry = Arc::clone(&ctx.registry);
        let metrics = Arc::clone(&ctx.metrics);
        let (mut client, accepted, peer) = accept_pair().await;

        let first = [0x03, 0x00, 0x00, 0x0D, 0, 0, 0, 0, 0, 0, 0, b'x', 0x0D];
        client.write_all(&first).await.unwrap();
        let handler = tokio::spawn(ConnectionHandler::new(peer, ctx).handle(accepted));

        let (mut upstream, _) = backend.accept().await.unwrap();
        let mut forwarded = [0u8; 13];
        upstream.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, first);

        drop(client);
        let outcome = handler.await.unwrap().unwrap();
        let HandlerOutcome::Relayed(summary) = outcome else {
            panic!("expected a relayed session, got {outcome:?}");
        };
        assert_eq!(summary.reason, TerminationReason::ClientClosed);

        assert!(registry.is_empty());
        assert_eq!(metrics.session_count(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.stats().snapshot().backend_connected, 1);
    }
}
