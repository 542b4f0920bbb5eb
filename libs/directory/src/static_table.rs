//! Static cookie table, typically loaded from a TOML file.
//!
//! ```toml
//! [[route]]
//! cookie = "Cookie: mstshash=alice"
//! endpoints = ["10.0.0.5:3389", "10.0.0.6:3389"]
//! socks5 = "127.0.0.1:1080"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::mstshash::mstshash_value;
use crate::{DirectoryError, Endpoint, EndpointResolver, ProxyDescriptor};

#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(default, rename = "route")]
    routes: Vec<TableRoute>,
}

#[derive(Debug, Deserialize)]
struct TableRoute {
    cookie: String,
    endpoints: Vec<SocketAddr>,
    #[serde(default)]
    socks5: Option<SocketAddr>,
}

/// Resolver backed by an explicit cookie → endpoints table.
///
/// Lookups try the cookie verbatim first, then its `mstshash` value, so a
/// table can be keyed either way.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    routes: HashMap<String, Vec<Endpoint>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the candidates for `cookie`.
    pub fn insert(&mut self, cookie: impl Into<String>, endpoints: Vec<Endpoint>) {
        self.routes.insert(cookie.into(), endpoints);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Parse a TOML table.
    pub fn from_toml_str(raw: &str) -> Result<Self, DirectoryError> {
        let file: TableFile =
            toml::from_str(raw).map_err(|e| DirectoryError::InvalidTable(e.to_string()))?;

        let mut resolver = Self::new();
        for route in file.routes {
            if route.cookie.is_empty() {
                return Err(DirectoryError::InvalidTable(
                    "route with empty cookie".to_string(),
                ));
            }
            let proxy = match route.socks5 {
                Some(addr) => ProxyDescriptor::Socks5 { addr },
                None => ProxyDescriptor::Direct,
            };
            let endpoints = route
                .endpoints
                .into_iter()
                .map(|addr| Endpoint::with_proxy(addr, proxy))
                .collect();
            resolver.insert(route.cookie, endpoints);
        }
        Ok(resolver)
    }

    /// Load a TOML table from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    fn lookup(&self, cookie: &str) -> Option<&Vec<Endpoint>> {
        self.routes
            .get(cookie)
            .or_else(|| self.routes.get(mstshash_value(cookie)))
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, cookie: &str) -> Result<Vec<Endpoint>, DirectoryError> {
        let endpoints = self.lookup(cookie).cloned().unwrap_or_default();
        debug!(cookie = %cookie, candidates = endpoints.len(), "Static directory lookup");
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
[[route]]
cookie = "Cookie: mstshash=alice"
endpoints = ["10.0.0.5:3389", "10.0.0.6:3389"]

[[route]]
cookie = "bob"
endpoints = ["10.0.0.7:3390"]
socks5 = "127.0.0.1:1080"
"#;

    #[tokio::test]
    async fn test_table_lookup_verbatim_and_by_value() {
        let resolver = StaticResolver::from_toml_str(TABLE).unwrap();
        assert_eq!(resolver.len(), 2);

        let alice = resolver.resolve("Cookie: mstshash=alice").await.unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].addr(), "10.0.0.5:3389".parse().unwrap());
        assert_eq!(alice[1].addr(), "10.0.0.6:3389".parse().unwrap());

        let bob = resolver.resolve("Cookie: mstshash=bob").await.unwrap();
        assert_eq!(
            bob[0].proxy(),
            ProxyDescriptor::Socks5 {
                addr: "127.0.0.1:1080".parse().unwrap()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_cookie_is_empty() {
        let resolver = StaticResolver::from_toml_str(TABLE).unwrap();
        assert!(resolver.resolve("Cookie: mstshash=carol").await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_table_rejected() {
        let err = StaticResolver::from_toml_str("[[route]]\ncookie = \"x\"\n").unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidTable(_)));

        let err = StaticResolver::from_toml_str(
            "[[route]]\ncookie = \"\"\nendpoints = [\"10.0.0.1:1\"]\n",
        )
        .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidTable(_)));
    }
}
