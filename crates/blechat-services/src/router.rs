//! Message router. Connects raw attribute writes to link sessions.
//!
//! Inbound: a write tagged (peer, attribute) is resolved to the peer's
//! session; writes to the session's message attribute are decoded as UTF-8
//! and published as remote messages. Outbound: a send request is resolved
//! to the session's transport handle and written to its message attribute.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use blechat_core::{IdentityRegistry, Message, PeerId};

use crate::link::{LinkState, SendError};
use crate::message_store::MessageStore;
use crate::session::SessionTable;
use crate::transport::Transport;

/// What an inbound write turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A chat message was published.
    Message(Message),
    /// The peer wrote the confirmation attribute.
    Confirmation,
    /// The attribute is not one this session listens to.
    Ignored,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InboundError {
    #[error("write from unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("write from {0} on a disconnected session")]
    NotConnected(PeerId),
    #[error("payload from {peer} is not valid UTF-8: {source}")]
    Decode {
        peer: PeerId,
        source: std::str::Utf8Error,
    },
}

#[derive(Clone)]
pub struct MessageRouter {
    sessions: SessionTable,
    registry: IdentityRegistry,
    transport: Arc<dyn Transport>,
    store: MessageStore,
    messages: broadcast::Sender<Message>,
}

impl MessageRouter {
    pub fn new(
        sessions: SessionTable,
        registry: IdentityRegistry,
        transport: Arc<dyn Transport>,
        store: MessageStore,
        channel_capacity: usize,
    ) -> Self {
        let (messages, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sessions,
            registry,
            transport,
            store,
            messages,
        }
    }

    /// Every message sent or received from now on. Slow subscribers lag
    /// instead of blocking the router.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    fn publish(&self, message: Message) {
        self.store.add(message.clone());
        // No subscribers is fine: the store still has it.
        let _ = self.messages.send(message);
    }

    /// Handle a write the peer made on its link.
    pub fn on_inbound(
        &self,
        peer_id: &PeerId,
        attribute_id: Uuid,
        payload: &[u8],
    ) -> Result<Inbound, InboundError> {
        let session = self
            .sessions
            .find(peer_id)
            .ok_or_else(|| InboundError::UnknownPeer(peer_id.clone()))?;

        if session.state() == LinkState::Disconnected {
            return Err(InboundError::NotConnected(peer_id.clone()));
        }

        if attribute_id == session.message_attr_id() {
            let text = std::str::from_utf8(payload).map_err(|source| InboundError::Decode {
                peer: peer_id.clone(),
                source,
            })?;
            tracing::debug!(peer = %peer_id, slot = session.slot_index(), len = payload.len(), "message received");
            let message = Message::remote(peer_id.clone(), session.slot_index(), text);
            self.publish(message.clone());
            return Ok(Inbound::Message(message));
        }

        if attribute_id == session.confirm_attr_id() {
            tracing::debug!(peer = %peer_id, "peer confirmed link");
            // The session may have been superseded since the lookup; then this is moot.
            let _ = self.sessions.mark_confirmed(peer_id, session.handle());
            return Ok(Inbound::Confirmation);
        }

        match self.registry.slot_for_attribute(&attribute_id) {
            Some(other) => tracing::debug!(
                peer = %peer_id,
                attribute = %attribute_id,
                attribute_slot = other.slot_index,
                session_slot = session.slot_index(),
                "write on another slot's attribute, ignoring"
            ),
            None => tracing::debug!(
                peer = %peer_id,
                attribute = %attribute_id,
                "write on unknown attribute, ignoring"
            ),
        }
        Ok(Inbound::Ignored)
    }

    /// Send `text` to a peer. Returns the published local message.
    pub async fn send(&self, peer_id: &PeerId, text: &str) -> Result<Message, SendError> {
        let session = self
            .sessions
            .find(peer_id)
            .ok_or_else(|| SendError::UnknownPeer(peer_id.clone()))?;

        session
            .send(
                self.transport.as_ref(),
                Bytes::copy_from_slice(text.as_bytes()),
            )
            .await?;

        tracing::debug!(peer = %peer_id, handle = %session.handle(), len = text.len(), "message sent");
        let message = Message::local(peer_id.clone(), session.slot_index(), text);
        self.publish(message.clone());
        Ok(message)
    }
}
