//! Relay configuration.
//!
//! Every setting comes from an `RDGATE_*` environment variable with a
//! default; only malformed values are errors.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rdgate_directory::DEFAULT_BACKEND_PORT;

use crate::proxy::RelayConfig;

const DEFAULT_ADMIN_BIND: &str = "127.0.0.1:8081";

/// Lowest accepted supervisor interval.
const MIN_SUPERVISOR_INTERVAL_MS: u64 = 10;

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener and session tuning.
    pub relay: RelayConfig,

    /// Operator API bind address; `None` disables the API.
    pub admin_bind: Option<SocketAddr>,

    /// Static directory table. Unset means the mstshash pass-through directory.
    pub directory_file: Option<PathBuf>,

    /// Backend port used by the pass-through directory.
    pub default_backend_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_ip = parse::<IpAddr, _>(&lookup, "RDGATE_BIND_ADDRESS")
            .context("RDGATE_BIND_ADDRESS must be an IP address.")?
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let port = parse::<u16, _>(&lookup, "RDGATE_PORT")
            .context("RDGATE_PORT must be a port number.")?
            .unwrap_or(3389);

        let mut relay = RelayConfig::new(SocketAddr::new(bind_ip, port));

        if let Some(backlog) = parse::<u32, _>(&lookup, "RDGATE_BACKLOG")
            .context("RDGATE_BACKLOG must be an integer.")?
        {
            relay.backlog = backlog.max(1);
        }

        if let Some(size) = parse::<usize, _>(&lookup, "RDGATE_RELAY_BUFFER_SIZE")
            .context("RDGATE_RELAY_BUFFER_SIZE must be an integer (bytes).")?
        {
            relay.buffer_size = size.max(1);
        }

        if let Some(ms) = parse::<u64, _>(&lookup, "RDGATE_CONNECT_TIMEOUT_MS")
            .context("RDGATE_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
        {
            relay.connect_timeout = Duration::from_millis(ms.max(1));
        }

        if let Some(ms) = parse::<u64, _>(&lookup, "RDGATE_READ_TIMEOUT_MS")
            .context("RDGATE_READ_TIMEOUT_MS must be an integer (milliseconds).")?
        {
            relay.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(attempts) = parse::<u32, _>(&lookup, "RDGATE_MAX_CONNECT_ATTEMPTS")
            .context("RDGATE_MAX_CONNECT_ATTEMPTS must be an integer.")?
        {
            relay.max_connect_attempts = attempts.max(1);
        }

        if let Some(ms) = parse::<u64, _>(&lookup, "RDGATE_CONNECT_RETRY_PAUSE_MS")
            .context("RDGATE_CONNECT_RETRY_PAUSE_MS must be an integer (milliseconds).")?
        {
            relay.connect_retry_pause = Duration::from_millis(ms);
        }

        if let Some(ms) = parse::<u64, _>(&lookup, "RDGATE_SUPERVISOR_INTERVAL_MS")
            .context("RDGATE_SUPERVISOR_INTERVAL_MS must be an integer (milliseconds).")?
        {
            relay.supervisor_interval = Duration::from_millis(ms.max(MIN_SUPERVISOR_INTERVAL_MS));
        }

        let admin_bind = match lookup("RDGATE_ADMIN_BIND") {
            Some(v) if v.eq_ignore_ascii_case("off") || v.is_empty() => None,
            Some(v) => Some(
                v.parse::<SocketAddr>()
                    .context("RDGATE_ADMIN_BIND must be host:port or \"off\".")?,
            ),
            None => Some(
                DEFAULT_ADMIN_BIND
                    .parse::<SocketAddr>()
                    .context("invalid default admin bind address")?,
            ),
        };

        let directory_file = lookup("RDGATE_DIRECTORY_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let default_backend_port = parse::<u16, _>(&lookup, "RDGATE_DEFAULT_BACKEND_PORT")
            .context("RDGATE_DEFAULT_BACKEND_PORT must be a port number.")?
            .unwrap_or(DEFAULT_BACKEND_PORT);

        let log_level = lookup("RDGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            relay,
            admin_bind,
            directory_file,
            default_backend_port,
            log_level,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, T::Err>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().parse()).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.relay.bind_addr, "0.0.0.0:3389".parse().unwrap());
        assert_eq!(config.relay.backlog, 100);
        assert_eq!(config.relay.buffer_size, 10_000);
        assert_eq!(config.relay.read_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.relay.max_connect_attempts, 10);
        assert_eq!(config.admin_bind, Some("127.0.0.1:8081".parse().unwrap()));
        assert!(config.directory_file.is_none());
        assert_eq!(config.default_backend_port, 3389);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("RDGATE_BIND_ADDRESS", "127.0.0.1"),
            ("RDGATE_PORT", "13389"),
            ("RDGATE_READ_TIMEOUT_MS", "0"),
            ("RDGATE_CONNECT_RETRY_PAUSE_MS", "250"),
            ("RDGATE_SUPERVISOR_INTERVAL_MS", "1"),
            ("RDGATE_ADMIN_BIND", "off"),
            ("RDGATE_DIRECTORY_FILE", "/etc/rdgate/routes.toml"),
        ])
        .unwrap();

        assert_eq!(config.relay.bind_addr, "127.0.0.1:13389".parse().unwrap());
        assert_eq!(config.relay.read_timeout, None);
        assert_eq!(config.relay.connect_retry_pause, Duration::from_millis(250));
        assert_eq!(config.relay.supervisor_interval, Duration::from_millis(10));
        assert!(config.admin_bind.is_none());
        assert_eq!(
            config.directory_file,
            Some(PathBuf::from("/etc/rdgate/routes.toml"))
        );
    }

    #[test]
    fn test_malformed_value_names_the_variable() {
        let err = load(&[("RDGATE_PORT", "rdp")]).unwrap_err();
        assert!(err.to_string().contains("RDGATE_PORT"));
    }
}
