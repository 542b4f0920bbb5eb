//! Backend dialing with failover across candidates and retry rounds.
//!
//! A dial runs up to `max_attempts` rounds. Each round tries every candidate
//! in order and returns the first socket that connects; a round in which
//! every candidate failed is followed by `retry_pause` before the next one.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rdgate_directory::{Endpoint, ProxyDescriptor};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Default connect timeout for a single backend attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of dial rounds.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default pause after a fully failed round.
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(5);

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("no candidate endpoints")]
    NoCandidates,

    #[error("all {candidates} candidate endpoint(s) failed after {attempts} attempt(s)")]
    Exhausted { candidates: usize, attempts: u32 },
}

/// Connects to one of a set of candidate backends.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
    max_attempts: u32,
    retry_pause: Duration,
}

impl Dialer {
    pub fn new(connect_timeout: Duration, max_attempts: u32, retry_pause: Duration) -> Self {
        Self {
            connect_timeout,
            max_attempts: max_attempts.max(1),
            retry_pause,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Dial the first reachable candidate.
    pub async fn connect(&self, candidates: &[Endpoint]) -> Result<(TcpStream, Endpoint), DialError> {
        if candidates.is_empty() {
            return Err(DialError::NoCandidates);
        }

        for attempt in 1..=self.max_attempts {
            for endpoint in candidates {
                match self.try_connect(endpoint).await {
                    Ok(stream) => {
                        debug!(backend = %endpoint, attempt, "Connected to backend");
                        return Ok((stream, *endpoint));
                    }
                    Err(e) => {
                        warn!(
                            backend = %endpoint,
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %e,
                            "Backend connection failed"
                        );
                    }
                }
            }

            if attempt < self.max_attempts {
                sleep(self.retry_pause).await;
            }
        }

        Err(DialError::Exhausted {
            candidates: candidates.len(),
            attempts: self.max_attempts,
        })
    }

    async fn try_connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        let attempt = async {
            match endpoint.proxy() {
                ProxyDescriptor::Direct => open_stream(endpoint.addr()).await,
                ProxyDescriptor::Socks5 { addr } => {
                    let mut stream = open_stream(addr).await?;
                    socks5_connect(&mut stream, endpoint.addr()).await?;
                    Ok(stream)
                }
            }
        };

        match timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_PAUSE)
    }
}

async fn open_stream(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_keepalive(true)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// No-auth SOCKS5 CONNECT to `target` over an open proxy connection.
async fn socks5_connect(stream: &mut TcpStream, target: SocketAddr) -> io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, SOCKS_NO_AUTH] {
        return Err(socks_error(format!(
            "proxy refused no-auth method (reply {:02x}{:02x})",
            choice[0], choice[1]
        )));
    }

    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match target {
        SocketAddr::V4(v4) => {
            request.push(SOCKS_ATYP_IPV4);
            request.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            request.push(SOCKS_ATYP_IPV6);
            request.extend_from_slice(&v6.ip().octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    // VER, REP, RSV, ATYP
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(socks_error(format!("unexpected proxy version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(socks_error(format!("proxy CONNECT failed with code {}", reply[1])));
    }

    let bound_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => stream.read_u8().await? as usize,
        other => return Err(socks_error(format!("unknown address type {other}"))),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn socks_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn quick_dialer(max_attempts: u32, pause: Duration) -> Dialer {
        Dialer::new(Duration::from_secs(2), max_attempts, pause)
    }

    #[tokio::test]
    async fn test_failover_within_one_round() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let dead_addr = refused_addr().await;

        let candidates = [Endpoint::new(dead_addr), Endpoint::new(live_addr)];
        let started = Instant::now();
        let (_stream, chosen) = quick_dialer(3, Duration::from_secs(5))
            .connect(&candidates)
            .await
            .unwrap();

        assert_eq!(chosen.addr(), live_addr);
        // no pause was taken
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let dead = Endpoint::new(refused_addr().await);
        let pause = Duration::from_millis(100);

        let started = Instant::now();
        let err = quick_dialer(3, pause).connect(&[dead]).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            DialError::Exhausted {
                candidates: 1,
                attempts: 3
            }
        ));
        // two pauses between three rounds, none after the last
        assert!(elapsed >= pause * 2);
        assert!(elapsed < pause * 3 + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_candidates_fail_immediately() {
        let err = quick_dialer(5, Duration::from_secs(5))
            .connect(&[])
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::NoCandidates));
    }

    /// One-shot SOCKS5 proxy that accepts a CONNECT and echoes afterwards.
    async fn stub_socks5(reply_code: u8) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            stream.write_all(&[5, 0]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[5, reply_code, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            if reply_code == 0 {
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await.unwrap();
                stream.write_all(&buf).await.unwrap();
            }
            request.to_vec()
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_socks5_connect() {
        let (proxy, task) = stub_socks5(0).await;
        let target: SocketAddr = "10.20.30.40:3389".parse().unwrap();
        let endpoint = Endpoint::with_proxy(target, ProxyDescriptor::Socks5 { addr: proxy });

        let (mut stream, chosen) = quick_dialer(1, Duration::ZERO)
            .connect(&[endpoint])
            .await
            .unwrap();
        assert_eq!(chosen, endpoint);

        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        let request = task.await.unwrap();
        assert_eq!(request, vec![5, 1, 0, 1, 10, 20, 30, 40, 0x0D, 0x3D]);
    }

    #[tokio::test]
    async fn test_socks5_refusal_is_a_dial_failure() {
        let (proxy, _task) = stub_socks5(5).await;
        let target: SocketAddr = "10.20.30.40:3389".parse().unwrap();
        let endpoint = Endpoint::with_proxy(target, ProxyDescriptor::Socks5 { addr: proxy });

        let err = quick_dialer(1, Duration::ZERO)
            .connect(&[endpoint])
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Exhausted { .. }));
    }
}
