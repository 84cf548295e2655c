use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use blechat_core::{Message, PeerId};

/// In-memory message history, bounded per peer.
#[derive(Clone)]
pub struct MessageStore {
    /// Messages per peer: peer_id -> oldest..newest
    messages: Arc<DashMap<PeerId, VecDeque<Message>>>,
    history_limit: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(500)
    }
}

impl MessageStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            messages: Arc::new(DashMap::new()),
            history_limit: history_limit.max(1),
        }
    }

    /// Add a message, evicting the oldest for that peer past the limit
    pub fn add(&self, message: Message) {
        let mut history = self.messages.entry(message.peer_id.clone()).or_default();
        history.push_back(message);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Get all messages with a peer
    pub fn get(&self, peer_id: &PeerId) -> Vec<Message> {
        self.messages
            .get(peer_id)
            .map(|msgs| msgs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get messages since timestamp
    pub fn get_since(&self, peer_id: &PeerId, since: u64) -> Vec<Message> {
        self.messages
            .get(peer_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.timestamp > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count messages with a peer
    pub fn count(&self, peer_id: &PeerId) -> usize {
        self.messages
            .get(peer_id)
            .map(|msgs| msgs.len())
            .unwrap_or(0)
    }

    /// Total messages across all peers
    pub fn total(&self) -> usize {
        self.messages.iter().map(|e| e.value().len()).sum()
    }

    /// Peers with at least one message
    pub fn peers(&self) -> Vec<PeerId> {
        self.messages.iter().map(|e| e.key().clone()).collect()
    }

    /// Clear all messages
    pub fn clear(&self) {
        self.messages.clear();
    }
}
