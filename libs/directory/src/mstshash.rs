//! Pass-through directory keyed by the `mstshash` cookie.

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

use crate::{DirectoryError, Endpoint, EndpointResolver};

/// Prefix of the routing token most clients send.
pub const MSTSHASH_PREFIX: &str = "Cookie: mstshash=";

/// Port dialed when a cookie only names a host.
pub const DEFAULT_BACKEND_PORT: u16 = 3389;

/// Strip the `mstshash` prefix from a cookie, if present.
pub fn mstshash_value(cookie: &str) -> &str {
    match cookie.find(MSTSHASH_PREFIX) {
        Some(idx) => &cookie[idx + MSTSHASH_PREFIX.len()..],
        None => cookie,
    }
}

/// Resolves the cookie value as a host name on a fixed port.
#[derive(Debug, Clone)]
pub struct MstsHashResolver {
    port: u16,
}

impl MstsHashResolver {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for MstsHashResolver {
    fn default() -> Self {
        Self::new(DEFAULT_BACKEND_PORT)
    }
}

#[async_trait]
impl EndpointResolver for MstsHashResolver {
    async fn resolve(&self, cookie: &str) -> Result<Vec<Endpoint>, DirectoryError> {
        let host = mstshash_value(cookie).trim();
        if host.is_empty() {
            return Err(DirectoryError::EmptyHost);
        }

        let addrs = lookup_host((host, self.port))
            .await
            .map_err(|source| DirectoryError::Lookup {
                host: host.to_string(),
                source,
            })?;

        let mut endpoints: Vec<Endpoint> = Vec::new();
        for addr in addrs {
            let endpoint = Endpoint::new(addr);
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }

        debug!(host = %host, candidates = endpoints.len(), "Resolved mstshash cookie");
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Cookie: mstshash=alice", "alice")]
    #[case("Cookie: mstshash=10.1.2.3", "10.1.2.3")]
    #[case("10.1.2.3", "10.1.2.3")]
    #[case("", "")]
    fn test_mstshash_value(#[case] cookie: &str, #[case] expected: &str) {
        assert_eq!(mstshash_value(cookie), expected);
    }

    #[tokio::test]
    async fn test_resolves_ip_literal_on_default_port() {
        let resolver = MstsHashResolver::default();
        let endpoints = resolver.resolve("Cookie: mstshash=1.2.3.4").await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::new("1.2.3.4:3389".parse().unwrap())]);
    }

    #[tokio::test]
    async fn test_resolves_bare_cookie_on_custom_port() {
        let resolver = MstsHashResolver::new(4000);
        let endpoints = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::new("127.0.0.1:4000".parse().unwrap())]);
    }

    #[tokio::test]
    async fn test_empty_host_is_rejected() {
        let resolver = MstsHashResolver::default();
        let err = resolver.resolve("Cookie: mstshash=").await.unwrap_err();
        assert!(matches!(err, DirectoryError::EmptyHost));
    }
}
