//! Listener manager.
//!
//! Opens one listener per identity slot so peers can reach us on any of
//! them, accepts the connections those listeners produce, and dials peers
//! on request. Every transport call is bounded by a timeout; nothing here
//! retries. Failures are collected per slot rather than aborting the batch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::timeout;

use blechat_core::{IdentityRegistry, IdentitySlot, PeerId};

use crate::link::Role;
use crate::session::{SessionRef, SessionTable};
use crate::transport::{
    ConnectionState, ListenerHandle, PeerDescriptor, Transport, TransportError, TransportHandle,
};

/// One failed listener or link operation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ListenerFailure {
    #[error("slot {slot_index}: open failed: {source}")]
    OpenFailed {
        slot_index: usize,
        source: TransportError,
    },
    #[error("slot {slot_index}: open timed out after {timeout:?}")]
    OpenTimedOut { slot_index: usize, timeout: Duration },
    #[error("slot {slot_index}: close failed: {source}")]
    CloseFailed {
        slot_index: usize,
        source: TransportError,
    },
    #[error("slot {slot_index}: close timed out after {timeout:?}")]
    CloseTimedOut { slot_index: usize, timeout: Duration },
    #[error("disconnect {peer} ({handle}) failed: {source}")]
    DisconnectFailed {
        peer: PeerId,
        handle: TransportHandle,
        source: TransportError,
    },
    #[error("disconnect {peer} ({handle}) timed out after {timeout:?}")]
    DisconnectTimedOut {
        peer: PeerId,
        handle: TransportHandle,
        timeout: Duration,
    },
}

impl ListenerFailure {
    /// The slot the failure belongs to, for listener failures.
    pub fn slot_index(&self) -> Option<usize> {
        match self {
            ListenerFailure::OpenFailed { slot_index, .. }
            | ListenerFailure::OpenTimedOut { slot_index, .. }
            | ListenerFailure::CloseFailed { slot_index, .. }
            | ListenerFailure::CloseTimedOut { slot_index, .. } => Some(*slot_index),
            ListenerFailure::DisconnectFailed { .. }
            | ListenerFailure::DisconnectTimedOut { .. } => None,
        }
    }
}

/// Every failure from one `start_all` or `stop_all` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerErrors(pub Vec<ListenerFailure>);

impl ListenerErrors {
    fn into_result(failures: Vec<ListenerFailure>) -> Result<(), ListenerErrors> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ListenerErrors(failures))
        }
    }

    pub fn failures(&self) -> &[ListenerFailure] {
        &self.0
    }

    /// Slots named by the failures, in order.
    pub fn slots(&self) -> Vec<usize> {
        self.0.iter().filter_map(ListenerFailure::slot_index).collect()
    }
}

impl fmt::Display for ListenerErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} listener operation(s) failed", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ListenerErrors {}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("no identity slot {0}")]
    UnknownSlot(usize),
    #[error("connect to {peer} timed out after {timeout:?}")]
    TimedOut { peer: PeerId, timeout: Duration },
    #[error("connect to {peer} failed: {source}")]
    Transport {
        peer: PeerId,
        source: TransportError,
    },
}

/// Owns the per-slot listeners and the inbound/outbound connect paths.
/// Clones share the same listeners.
#[derive(Clone)]
pub struct ListenerManager {
    registry: IdentityRegistry,
    transport: Arc<dyn Transport>,
    sessions: SessionTable,
    /// slot index -> open listener
    listeners: Arc<Mutex<BTreeMap<usize, ListenerHandle>>>,
    open_timeout: Duration,
    connect_timeout: Duration,
}

impl ListenerManager {
    pub fn new(
        registry: IdentityRegistry,
        transport: Arc<dyn Transport>,
        sessions: SessionTable,
        open_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            sessions,
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            open_timeout,
            connect_timeout,
        }
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<usize, ListenerHandle>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slots with an open listener, ascending.
    pub fn listening_slots(&self) -> Vec<usize> {
        self.listeners().keys().copied().collect()
    }

    /// Drop every listener record without closing it.
    pub(crate) fn forget_all(&self) {
        self.listeners().clear();
    }

    /// Open a listener on every slot that does not have one yet.
    pub async fn start_all(&self) -> Result<(), ListenerErrors> {
        let mut failures = Vec::new();

        for slot in self.registry.slots() {
            if self.listeners().contains_key(&slot.slot_index) {
                continue;
            }

            match timeout(self.open_timeout, self.transport.open_listener(slot)).await {
                Ok(Ok(handle)) => {
                    tracing::info!(
                        slot = slot.slot_index,
                        service = %slot.service_id,
                        listener = %handle,
                        "listening"
                    );
                    self.listeners().insert(slot.slot_index, handle);
                }
                Ok(Err(source)) => {
                    tracing::warn!(slot = slot.slot_index, error = %source, "listener open failed");
                    failures.push(ListenerFailure::OpenFailed {
                        slot_index: slot.slot_index,
                        source,
                    });
                }
                Err(_) => {
                    tracing::warn!(slot = slot.slot_index, timeout = ?self.open_timeout, "listener open timed out");
                    failures.push(ListenerFailure::OpenTimedOut {
                        slot_index: slot.slot_index,
                        timeout: self.open_timeout,
                    });
                }
            }
        }

        ListenerErrors::into_result(failures)
    }

    /// Close every listener and every live link.
    ///
    /// Listeners are drained and sessions marked Disconnected before any
    /// transport call, so a second call finds nothing left to close.
    pub async fn stop_all(&self) -> Result<(), ListenerErrors> {
        let mut failures = Vec::new();

        let drained = std::mem::take(&mut *self.listeners());
        for (slot_index, handle) in drained {
            match timeout(self.open_timeout, self.transport.close_listener(handle)).await {
                Ok(Ok(())) => tracing::info!(slot = slot_index, listener = %handle, "listener closed"),
                Ok(Err(source)) => {
                    tracing::warn!(slot = slot_index, error = %source, "listener close failed");
                    failures.push(ListenerFailure::CloseFailed { slot_index, source });
                }
                Err(_) => {
                    tracing::warn!(slot = slot_index, "listener close timed out");
                    failures.push(ListenerFailure::CloseTimedOut {
                        slot_index,
                        timeout: self.open_timeout,
                    });
                }
            }
        }

        for session in self.sessions.disconnect_all() {
            let peer = session.peer_id().clone();
            let handle = session.handle();
            match timeout(self.open_timeout, self.transport.disconnect(handle)).await {
                Ok(Ok(())) => tracing::debug!(peer = %peer, %handle, "link closed"),
                // The radio already dropped it.
                Ok(Err(TransportError::UnknownHandle(_))) => {}
                Ok(Err(source)) => {
                    tracing::warn!(peer = %peer, %handle, error = %source, "disconnect failed");
                    failures.push(ListenerFailure::DisconnectFailed {
                        peer,
                        handle,
                        source,
                    });
                }
                Err(_) => {
                    tracing::warn!(peer = %peer, %handle, "disconnect timed out");
                    failures.push(ListenerFailure::DisconnectTimedOut {
                        peer,
                        handle,
                        timeout: self.open_timeout,
                    });
                }
            }
        }

        ListenerErrors::into_result(failures)
    }

    /// Record a peer that connected to the listener on `slot_index`.
    ///
    /// If the peer already has an open session the new link is surplus and
    /// is closed, unless the open session is our own dial and loses the
    /// crossed-link tie-break; then the inbound link takes its place.
    pub async fn accept_inbound(
        &self,
        slot_index: usize,
        peer_id: PeerId,
        handle: TransportHandle,
    ) -> Result<SessionRef, ConnectError> {
        let slot = *self
            .registry
            .slot(slot_index)
            .ok_or(ConnectError::UnknownSlot(slot_index))?;

        let session = self
            .sessions
            .upsert_connecting(peer_id.clone(), Role::Server, handle, &slot);
        if session.handle() == handle {
            return Ok(session);
        }

        let local = self.transport.local_address();
        if session.role() == Role::Client && dialer_wins(&peer_id, &local) {
            Ok(self.take_over(&session, Role::Server, handle, &slot).await)
        } else {
            self.close_surplus(&peer_id, handle).await;
            Ok(session)
        }
    }

    /// Dial a peer on the descriptor's slot. An open session for the peer
    /// is returned as is, without dialing.
    pub async fn connect_to(&self, peer: PeerDescriptor) -> Result<SessionRef, ConnectError> {
        if let Some(existing) = self.sessions.find(&peer.peer_id) {
            if existing.is_open() {
                tracing::debug!(peer = %peer.peer_id, handle = %existing.handle(), "already linked");
                return Ok(existing);
            }
        }
        if self.registry.slot(peer.slot.slot_index) != Some(&peer.slot) {
            return Err(ConnectError::UnknownSlot(peer.slot.slot_index));
        }

        tracing::info!(peer = %peer.peer_id, slot = peer.slot.slot_index, "connecting");
        let handle = match timeout(self.connect_timeout, self.transport.connect(&peer)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(source)) => {
                return Err(ConnectError::Transport {
                    peer: peer.peer_id,
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectError::TimedOut {
                    peer: peer.peer_id,
                    timeout: self.connect_timeout,
                })
            }
        };

        let mut session =
            self.sessions
                .upsert_connecting(peer.peer_id.clone(), Role::Client, handle, &peer.slot);
        if session.handle() != handle {
            // The peer reached us first.
            let local = self.transport.local_address();
            if session.role() == Role::Server && dialer_wins(&local, &peer.peer_id) {
                session = self.take_over(&session, Role::Client, handle, &peer.slot).await;
            }
            if session.handle() != handle {
                self.close_surplus(&peer.peer_id, handle).await;
                return Ok(session);
            }
        }

        // `connect` only resolves once the link is up.
        if let Err(e) =
            self.sessions
                .apply_link_state(&peer.peer_id, handle, ConnectionState::Connected)
        {
            tracing::warn!(peer = %peer.peer_id, %handle, error = %e, "link dropped while connecting");
        }
        Ok(self.sessions.find(&peer.peer_id).unwrap_or(session))
    }

    /// Move the peer's session from the link it holds onto `handle` and
    /// close the old link. Returns the session as it stands afterwards; if
    /// it changed under us nothing is closed here.
    async fn take_over(
        &self,
        existing: &SessionRef,
        role: Role,
        handle: TransportHandle,
        slot: &IdentitySlot,
    ) -> SessionRef {
        let old = existing.handle();
        let session =
            self.sessions
                .supersede(existing.peer_id().clone(), old, role, handle, slot);
        if session.handle() == handle {
            tracing::info!(peer = %session.peer_id(), %old, new = %handle, "crossed link kept");
            self.close_surplus(session.peer_id(), old).await;
        }
        session
    }

    async fn close_surplus(&self, peer: &PeerId, handle: TransportHandle) {
        tracing::info!(peer = %peer, %handle, "closing surplus link");
        match timeout(self.open_timeout, self.transport.disconnect(handle)).await {
            Ok(Ok(())) => {}
            // The other end closed it first.
            Ok(Err(TransportError::UnknownHandle(_))) => {}
            Ok(Err(e)) => tracing::warn!(peer = %peer, %handle, error = %e, "surplus link close failed"),
            Err(_) => tracing::warn!(peer = %peer, %handle, "surplus link close timed out"),
        }
    }
}

/// When both devices dial each other at once, each end holds two links to
/// the same peer. Both ends keep the link dialed by the lower address, so
/// they agree on the survivor without talking to each other.
fn dialer_wins(dialer: &PeerId, acceptor: &PeerId) -> bool {
    dialer < acceptor
}
