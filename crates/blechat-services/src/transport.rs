//! Transport contract: what the session layer needs from a GATT radio.
//!
//! The radio performs advertising, scanning and link establishment. This
//! layer only opens listeners, dials peers, writes attributes, and consumes
//! the events the radio reports. Events are immutable records carrying the
//! full context of the callback (peer, handle, slot); they are delivered on
//! the channel handed to the radio when it is constructed.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use blechat_core::{IdentitySlot, PeerId};

/// Opaque handle for one established link. Unique per link, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TransportHandle(pub u64);

/// Opaque handle for one listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ListenerHandle(pub u64);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A peer we intend to dial, and the identity slot to reach it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub slot: IdentitySlot,
}

/// Link-layer connection state as reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Everything the radio reports asynchronously.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer connected to one of our listeners.
    InboundConnection {
        slot_index: usize,
        peer_id: PeerId,
        handle: TransportHandle,
    },
    ConnectionStateChanged {
        peer_id: PeerId,
        handle: TransportHandle,
        state: ConnectionState,
    },
    /// The peer wrote an attribute on the link.
    InboundWrite {
        peer_id: PeerId,
        handle: TransportHandle,
        attribute_id: Uuid,
        payload: Bytes,
    },
    AdvertiseFailed {
        slot_index: usize,
        reason: String,
    },
    RadioStateChanged {
        enabled: bool,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a radio reports its events on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("radio is not enabled")]
    RadioDisabled,
    #[error("no peer {0} is listening on the requested service")]
    PeerUnreachable(PeerId),
    #[error("unknown {0}")]
    UnknownHandle(TransportHandle),
    #[error("unknown {0}")]
    UnknownListener(ListenerHandle),
    #[error("radio refused: {0}")]
    Refused(String),
}

/// Failure of a single attribute write. Success only means the local radio
/// accepted the bytes, not that the peer processed them.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("link {0} is closed")]
    LinkClosed(TransportHandle),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// A GATT radio seen from the session layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the radio is powered and usable.
    fn radio_enabled(&self) -> bool;

    /// The address peers see for this radio.
    fn local_address(&self) -> PeerId;

    /// Start advertising `slot.service_id` and accepting connections on it.
    async fn open_listener(&self, slot: &IdentitySlot) -> Result<ListenerHandle, TransportError>;

    async fn close_listener(&self, listener: ListenerHandle) -> Result<(), TransportError>;

    /// Dial a peer. Resolves once the link is connected (or failed).
    async fn connect(&self, peer: &PeerDescriptor) -> Result<TransportHandle, TransportError>;

    /// Write `payload` to `attribute_id` on the link. Does not wait for the
    /// peer to acknowledge.
    async fn write(
        &self,
        handle: TransportHandle,
        attribute_id: Uuid,
        payload: Bytes,
    ) -> Result<(), WriteError>;

    /// Tear down a link. The radio reports `Disconnected` for it afterwards.
    async fn disconnect(&self, handle: TransportHandle) -> Result<(), TransportError>;
}
