//! Link session: the state of one connection to one peer.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use blechat_core::{IdentitySlot, PeerId};

use crate::transport::{Transport, TransportHandle, WriteError};

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The peer connected to one of our listeners.
    Server,
    /// We dialed the peer.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: LinkState, to: LinkState },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),
    #[error("session with {0} is not connected")]
    NotConnected(PeerId),
    #[error("transport write failed: {0}")]
    TransportWriteFailed(#[from] WriteError),
}

/// One connection to one peer.
///
/// The session table owns these; everyone else sees immutable snapshots.
#[derive(Debug, Clone)]
pub struct LinkSession {
    peer_id: PeerId,
    role: Role,
    handle: TransportHandle,
    slot_index: usize,
    message_attr_id: Uuid,
    confirm_attr_id: Uuid,
    state: LinkState,
    created_at: Instant,
    connected_at: Option<Instant>,
    last_confirmed_at: Option<Instant>,
}

impl LinkSession {
    /// New session in `Connecting`, bound to the slot's attributes.
    pub fn new(peer_id: PeerId, role: Role, handle: TransportHandle, slot: &IdentitySlot) -> Self {
        Self {
            peer_id,
            role,
            handle,
            slot_index: slot.slot_index,
            message_attr_id: slot.message_attr_id,
            confirm_attr_id: slot.confirm_attr_id,
            state: LinkState::Connecting,
            created_at: Instant::now(),
            connected_at: None,
            last_confirmed_at: None,
        }
    }

    /// Move to `next`. Returns `Ok(false)` when already there.
    ///
    /// `Disconnected` is terminal: the session has to be replaced with a
    /// fresh transport handle instead.
    pub fn transition(&mut self, next: LinkState) -> Result<bool, SessionError> {
        use LinkState::*;

        if self.state == next {
            return Ok(false);
        }
        match (self.state, next) {
            (Connecting, Connected) => self.connected_at = Some(Instant::now()),
            (Connecting, Disconnected) | (Connected, Disconnected) => {}
            (from, to) => return Err(SessionError::InvalidTransition { from, to }),
        }
        self.state = next;
        Ok(true)
    }

    /// Write `payload` to the peer's message attribute.
    ///
    /// Returns once the local radio accepted the write.
    pub async fn send(&self, transport: &dyn Transport, payload: Bytes) -> Result<(), SendError> {
        if self.state != LinkState::Connected {
            return Err(SendError::NotConnected(self.peer_id.clone()));
        }
        transport
            .write(self.handle, self.message_attr_id, payload)
            .await?;
        Ok(())
    }

    pub(crate) fn record_confirmation(&mut self) {
        self.last_confirmed_at = Some(Instant::now());
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn message_attr_id(&self) -> Uuid {
        self.message_attr_id
    }

    pub fn confirm_attr_id(&self) -> Uuid {
        self.confirm_attr_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Connecting or Connected.
    pub fn is_open(&self) -> bool {
        self.state != LinkState::Disconnected
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the link became Connected, if it ever did.
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at.map(|t| t.elapsed())
    }

    /// Time since the peer last wrote the confirmation attribute.
    pub fn since_confirmed(&self) -> Option<Duration> {
        self.last_confirmed_at.map(|t| t.elapsed())
    }
}
