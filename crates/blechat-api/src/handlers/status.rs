//! /status, /slots, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use blechat_core::IdentitySlot;

use super::{ApiState, SessionJson};

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub radio_enabled: bool,
    pub listening_slots: Vec<usize>,
    pub sessions: Vec<SessionJson>,
    pub connected: usize,
    pub messages: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let node = &state.node;
    let sessions: Vec<SessionJson> = node
        .sessions()
        .snapshot()
        .iter()
        .map(SessionJson::from)
        .collect();
    let radio_enabled = *node.radio_enabled().borrow();

    Json(StatusResponse {
        radio_enabled,
        listening_slots: node.listening_slots(),
        connected: node.sessions().connected_count(),
        sessions,
        messages: node.store().total(),
    })
}

// ── /slots ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SlotsResponse {
    pub slots: Vec<IdentitySlot>,
}

pub async fn handle_slots(State(state): State<ApiState>) -> Json<SlotsResponse> {
    Json(SlotsResponse {
        slots: state.node.registry().slots().to_vec(),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
