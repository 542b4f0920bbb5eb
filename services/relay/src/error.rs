//! Relay error types.

use std::io;
use std::net::SocketAddr;

use rdgate_directory::DirectoryError;
use thiserror::Error;

use crate::proxy::DialError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("backend dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("failed to forward first frame to backend: {0}")]
    Handshake(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
