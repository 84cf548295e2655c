//! Chat message as seen by the UI layer.
//!
//! Messages are ephemeral: the router produces them, subscribers and the
//! in-memory store consume them. Nothing here is persisted.

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Which side of the link wrote the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Sent by this device.
    Local,
    /// Written to us by the peer.
    Remote,
}

/// One text message exchanged with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub origin: Origin,
    /// The remote end of the link, for both local and remote messages.
    pub peer_id: PeerId,
    /// Identity slot the link is bound to.
    pub slot_index: usize,
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

impl Message {
    pub fn local(peer_id: PeerId, slot_index: usize, text: impl Into<String>) -> Self {
        Self::new(Origin::Local, peer_id, slot_index, text.into())
    }

    pub fn remote(peer_id: PeerId, slot_index: usize, text: impl Into<String>) -> Self {
        Self::new(Origin::Remote, peer_id, slot_index, text.into())
    }

    fn new(origin: Origin, peer_id: PeerId, slot_index: usize, text: String) -> Self {
        Self {
            origin,
            peer_id,
            slot_index,
            text,
            timestamp: now_millis(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.origin, Origin::Remote)
    }
}

/// Milliseconds since the Unix epoch. Clock errors collapse to 0.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
