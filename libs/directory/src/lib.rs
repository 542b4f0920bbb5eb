//! # rdgate-directory
//!
//! The routing directory consumed by the rdgate relay.
//!
//! The relay extracts an opaque routing cookie from a client's first frame
//! and asks an [`EndpointResolver`] which backend endpoints it may dial.
//! How a cookie maps to endpoints is entirely the directory's business.
//!
//! Two resolvers ship with the crate:
//! - [`MstsHashResolver`]: pass-through default; treats the cookie value as a
//!   host name and resolves it on a fixed port.
//! - [`StaticResolver`]: an explicit cookie table, usually loaded from TOML.

mod endpoint;
mod error;
mod mstshash;
mod resolver;
mod static_table;

pub use endpoint::{Endpoint, ProxyDescriptor};
pub use error::DirectoryError;
pub use mstshash::{mstshash_value, MstsHashResolver, DEFAULT_BACKEND_PORT, MSTSHASH_PREFIX};
pub use resolver::{EndpointResolver, SessionHandle};
pub use static_table::StaticResolver;
