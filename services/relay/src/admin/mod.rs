//! Operator HTTP API.
//!
//! A thin JSON surface over the listener manager and the session registry:
//! health, session listing and kill, listener start/stop and relay metrics.

pub mod error;
mod health;
mod listener;
mod sessions;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::proxy::ListenerManager;

/// Shared state for the operator API.
#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<ListenerManager>,
}

/// Create the operator API router.
pub fn create_router(manager: Arc<ListenerManager>) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", sessions::routes().merge(listener::routes()))
        .layer(TraceLayer::new_for_http())
        .with_state(AdminState { manager })
}

/// Serve the operator API on an already bound listener.
pub async fn serve(listener: TcpListener, manager: Arc<ListenerManager>) -> std::io::Result<()> {
    info!(bind_addr = %listener.local_addr()?, "Operator API listening");
    axum::serve(listener, create_router(manager)).await
}
