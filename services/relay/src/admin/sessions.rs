//! Live session listing and kill.

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;

use super::error::ApiError;
use super::AdminState;
use crate::proxy::{SessionId, SessionInfo};

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct KillResponse {
    pub id: String,
    /// False when the session was unknown or already terminating.
    pub killed: bool,
}

pub fn routes() -> Router<AdminState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(kill_session))
}

async fn list_sessions(State(state): State<AdminState>) -> Json<SessionList> {
    Json(SessionList {
        sessions: state.manager.registry().list(),
    })
}

async fn kill_session(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<KillResponse>, ApiError> {
    let session_id: SessionId = id
        .parse()
        .map_err(|e| ApiError::bad_request("invalid_session_id", format!("{e}")))?;

    let killed = state.manager.registry().kill(&session_id);
    Ok(Json(KillResponse {
        id: session_id.to_string(),
        killed,
    }))
}
