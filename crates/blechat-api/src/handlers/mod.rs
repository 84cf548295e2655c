//! HTTP API handlers, exposing node state as JSON.

pub mod messages;
pub mod sessions;
pub mod status;

use axum::http::StatusCode;
use serde::Serialize;

use blechat_core::PeerId;
use blechat_services::{ChatNode, LinkState, Role, SessionRef};

#[derive(Clone)]
pub struct ApiState {
    pub node: ChatNode,
    /// Shutdown broadcast sender, signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a peer address from a path or body field.
fn parse_peer(raw: &str) -> Result<PeerId, (StatusCode, String)> {
    let peer = PeerId::new(raw);
    if peer.as_str().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "peer id is empty".to_string()));
    }
    Ok(peer)
}

#[derive(Serialize)]
pub struct SessionJson {
    pub peer_id: String,
    pub role: Role,
    pub state: LinkState,
    pub handle: u64,
    pub slot_index: usize,
    pub uptime_secs: Option<u64>,
    pub last_confirmed_secs: Option<u64>,
}

impl From<&SessionRef> for SessionJson {
    fn from(s: &SessionRef) -> Self {
        Self {
            peer_id: s.peer_id().to_string(),
            role: s.role(),
            state: s.state(),
            handle: s.handle().0,
            slot_index: s.slot_index(),
            uptime_secs: s.uptime().map(|d| d.as_secs()),
            last_confirmed_secs: s.since_confirmed().map(|d| d.as_secs()),
        }
    }
}

// Re-export handler functions for use in router setup.
pub use messages::{handle_get_messages, handle_send_message};
pub use sessions::{handle_connect, handle_session_drop, handle_session_inspect};
pub use status::{handle_shutdown, handle_slots, handle_status};
