//! Listener control and relay metrics.

use std::net::SocketAddr;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use super::error::ApiError;
use super::AdminState;
use crate::proxy::MetricsSnapshot;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ListenerStatus {
    pub listening: bool,
    pub local_addr: Option<SocketAddr>,
}

pub fn routes() -> Router<AdminState> {
    Router::new()
        .route("/listener", get(status))
        .route("/listener/start", post(start))
        .route("/listener/stop", post(stop))
        .route("/metrics", get(metrics))
}

async fn status(State(state): State<AdminState>) -> Json<ListenerStatus> {
    Json(ListenerStatus {
        listening: state.manager.is_listening(),
        local_addr: state.manager.local_addr().await,
    })
}

async fn start(State(state): State<AdminState>) -> Result<Json<ListenerStatus>, ApiError> {
    let local_addr = state.manager.start().await.map_err(|e| {
        error!(error = %e, "Failed to start listener");
        ApiError::internal("listener_start_failed", e.to_string())
    })?;

    Ok(Json(ListenerStatus {
        listening: true,
        local_addr: Some(local_addr),
    }))
}

async fn stop(State(state): State<AdminState>) -> Json<ListenerStatus> {
    state.manager.stop().await;
    Json(ListenerStatus {
        listening: false,
        local_addr: None,
    })
}

async fn metrics(State(state): State<AdminState>) -> Json<MetricsSnapshot> {
    Json(state.manager.metrics().snapshot())
}
