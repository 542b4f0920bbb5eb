//! The resolver contract consumed by the relay.

use std::fmt;

use async_trait::async_trait;

use crate::{DirectoryError, Endpoint};

/// Maps a routing cookie to the backend endpoints the relay may dial.
///
/// Implementations are shared across every connection handler, so they must
/// be cheap to call concurrently.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Resolve `cookie` to an ordered list of candidate endpoints.
    ///
    /// An empty list means the cookie is not routable and the client is
    /// refused.
    async fn resolve(&self, cookie: &str) -> Result<Vec<Endpoint>, DirectoryError>;

    /// Open a bookkeeping hook for a session routed by `cookie`.
    ///
    /// The returned handle is closed when the relayed connection terminates.
    async fn open_session(&self, _cookie: &str) -> Result<SessionHandle, DirectoryError> {
        Ok(SessionHandle::noop())
    }
}

type CloseFn = Box<dyn FnOnce() + Send + Sync>;

/// Directory-side session hook, released exactly once.
///
/// Dropping an unclosed handle closes it.
pub struct SessionHandle {
    on_close: Option<CloseFn>,
}

impl SessionHandle {
    /// A handle that does nothing on close.
    pub fn noop() -> Self {
        Self { on_close: None }
    }

    /// A handle that runs `on_close` when the session ends.
    pub fn new(on_close: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Release the hook.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("armed", &self.on_close.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_session_handle_closes_once() {
        let closed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&closed);
        let handle = SessionHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_handle_closes_on_drop() {
        let closed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&closed);
        {
            let _handle = SessionHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    struct Fixed;

    #[async_trait]
    impl EndpointResolver for Fixed {
        async fn resolve(&self, _cookie: &str) -> Result<Vec<Endpoint>, DirectoryError> {
            Ok(vec![Endpoint::new("127.0.0.1:3389".parse().unwrap())])
        }
    }

    #[tokio::test]
    async fn test_default_open_session_is_noop() {
        let handle = Fixed.open_session("anything").await.unwrap();
        assert!(format!("{:?}", handle).contains("armed: false"));
    }
}
