//! /messages handlers: history and sending.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use blechat_core::Message;
use blechat_services::SendError;

use super::{parse_peer, ApiState};

// ── /messages/{peer_id} (GET) ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct MessagesResponse {
    pub peer_id: String,
    pub messages: Vec<Message>,
}

pub async fn handle_get_messages(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
) -> Result<Json<MessagesResponse>, (StatusCode, String)> {
    let peer = parse_peer(&peer_id)?;
    let messages = state.node.store().get(&peer);

    Ok(Json(MessagesResponse {
        peer_id: peer.to_string(),
        messages,
    }))
}

// ── /messages/send (POST) ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub to: String,
    pub text: String,
}

#[derive(Serialize)]
pub struct SendMessageResponse {
    pub peer_id: String,
    pub slot_index: usize,
    pub timestamp: u64,
}

pub async fn handle_send_message(
    State(state): State<ApiState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, (StatusCode, String)> {
    let to = parse_peer(&req.to)?;

    let message = state.node.send(&to, &req.text).await.map_err(|e| {
        let status = match e {
            SendError::UnknownPeer(_) => StatusCode::NOT_FOUND,
            SendError::NotConnected(_) => StatusCode::CONFLICT,
            SendError::TransportWriteFailed(_) => StatusCode::BAD_GATEWAY,
        };
        (status, e.to_string())
    })?;

    Ok(Json(SendMessageResponse {
        peer_id: message.peer_id.to_string(),
        slot_index: message.slot_index,
        timestamp: message.timestamp,
    }))
}
