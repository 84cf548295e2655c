//! /sessions and /connect handlers: session inspection and link control.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use blechat_services::ConnectError;

use super::{parse_peer, ApiState, SessionJson};

// ── /sessions/{peer_id} (GET) ─────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
) -> Result<Json<SessionJson>, (StatusCode, String)> {
    let peer = parse_peer(&peer_id)?;

    let session = state
        .node
        .sessions()
        .find(&peer)
        .ok_or((StatusCode::NOT_FOUND, "session not found".to_string()))?;

    Ok(Json(SessionJson::from(&session)))
}

// ── /sessions/{peer_id} (DELETE) ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionDropResponse {
    pub peer_id: String,
    pub disconnected: bool,
}

pub async fn handle_session_drop(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
) -> Result<Json<SessionDropResponse>, (StatusCode, String)> {
    let peer = parse_peer(&peer_id)?;

    if state.node.sessions().find(&peer).is_none() {
        return Err((StatusCode::NOT_FOUND, "session not found".to_string()));
    }
    let disconnected = state
        .node
        .disconnect_peer(&peer)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    if disconnected {
        tracing::info!(peer = %peer, "session disconnected via API");
    }

    Ok(Json(SessionDropResponse {
        peer_id: peer.to_string(),
        disconnected,
    }))
}

// ── /connect (POST) ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub peer_id: String,
    pub slot_index: usize,
}

pub async fn handle_connect(
    State(state): State<ApiState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<SessionJson>, (StatusCode, String)> {
    let peer = parse_peer(&req.peer_id)?;

    let session = state
        .node
        .connect_slot(peer, req.slot_index)
        .await
        .map_err(|e| {
            let status = match e {
                ConnectError::UnknownSlot(_) => StatusCode::BAD_REQUEST,
                ConnectError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
                ConnectError::Transport { .. } => StatusCode::BAD_GATEWAY,
            };
            (status, e.to_string())
        })?;

    Ok(Json(SessionJson::from(&session)))
}
