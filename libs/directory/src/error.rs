//! Error types for directory lookups.

use thiserror::Error;

/// Errors raised by a directory while resolving a cookie.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Host name lookup failed.
    #[error("lookup failed for host '{host}': {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// The cookie did not carry a usable host.
    #[error("cookie does not name a host")]
    EmptyHost,

    /// A static directory table could not be parsed.
    #[error("invalid directory table: {0}")]
    InvalidTable(String),

    /// Reading a directory file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening a session hook failed.
    #[error("session rejected: {0}")]
    SessionRejected(String),
}
