//! Dialable backend endpoints.

use std::fmt;
use std::net::SocketAddr;

/// How the relay reaches an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProxyDescriptor {
    /// Connect straight to the endpoint.
    #[default]
    Direct,
    /// Tunnel through a SOCKS5 proxy (no authentication).
    Socks5 { addr: SocketAddr },
}

/// A backend the relay may dial: address, port and outbound proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
    proxy: ProxyDescriptor,
}

impl Endpoint {
    /// Create a direct endpoint.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            proxy: ProxyDescriptor::Direct,
        }
    }

    /// Create an endpoint reached through `proxy`.
    pub fn with_proxy(addr: SocketAddr, proxy: ProxyDescriptor) -> Self {
        Self { addr, proxy }
    }

    /// Target socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Outbound proxy descriptor.
    pub fn proxy(&self) -> ProxyDescriptor {
        self.proxy
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy {
            ProxyDescriptor::Direct => write!(f, "{}", self.addr),
            ProxyDescriptor::Socks5 { addr } => write!(f, "{} via socks5://{}", self.addr, addr),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}
