//! Session table: one link session per peer, shared across all tasks.
//!
//! Every mutation runs under a single table-wide lock, and the observable
//! snapshot is republished before that lock is released. Subscribers
//! therefore see snapshots in mutation order, and every snapshot is a
//! complete copy of the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use blechat_core::{IdentitySlot, PeerId};

use crate::link::{LinkSession, LinkState, Role, SessionError};
use crate::transport::{ConnectionState, TransportHandle};

/// Immutable view of one session at the moment it was read.
pub type SessionRef = Arc<LinkSession>;

/// Ordered copy of every session, in first-seen order.
pub type SessionSnapshot = Arc<[SessionRef]>;

#[derive(Default)]
struct Inner {
    /// Insertion order for display. A replaced session keeps its slot.
    order: Vec<PeerId>,
    sessions: HashMap<PeerId, SessionRef>,
}

impl Inner {
    fn snapshot(&self) -> SessionSnapshot {
        self.order
            .iter()
            .filter_map(|peer| self.sessions.get(peer).cloned())
            .collect()
    }
}

/// The session table. Clones share the same state.
#[derive(Clone)]
pub struct SessionTable {
    inner: Arc<Mutex<Inner>>,
    snapshots: Arc<watch::Sender<SessionSnapshot>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionSnapshot::from(Vec::new()));
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            snapshots: Arc::new(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No code path panics while holding the lock; recover if one ever does.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.snapshots.send_replace(inner.snapshot());
    }

    /// Record a connection attempt for `peer_id`.
    ///
    /// - no session: a new one is created in `Connecting`
    /// - `Disconnected` session: replaced, the new handle supersedes the old
    /// - `Connecting`/`Connected` session: returned unchanged
    ///
    /// Callers that offered a handle different from the returned session's
    /// handle hold a surplus link and should close it.
    pub fn upsert_connecting(
        &self,
        peer_id: PeerId,
        role: Role,
        handle: TransportHandle,
        slot: &IdentitySlot,
    ) -> SessionRef {
        let mut inner = self.lock();

        match inner.sessions.get(&peer_id).cloned() {
            Some(existing) if existing.is_open() => {
                tracing::debug!(
                    peer = %peer_id,
                    existing = %existing.handle(),
                    offered = %handle,
                    state = %existing.state(),
                    "session already open, keeping it"
                );
                return existing;
            }
            Some(existing) => {
                tracing::info!(
                    peer = %peer_id,
                    old = %existing.handle(),
                    new = %handle,
                    ?role,
                    slot = slot.slot_index,
                    "replacing disconnected session"
                );
            }
            None => {
                tracing::info!(
                    peer = %peer_id,
                    handle = %handle,
                    ?role,
                    slot = slot.slot_index,
                    "session created"
                );
                inner.order.push(peer_id.clone());
            }
        }

        self.install(&mut inner, peer_id, role, handle, slot)
    }

    /// Replace the session for `peer_id` with a new one on `handle`, even
    /// if it is still open, as long as its current handle is `superseded`.
    ///
    /// Used when two crossed links race and the existing one loses. If the
    /// session moved on to another handle meanwhile it is returned
    /// unchanged, and the caller's handle is surplus as with
    /// `upsert_connecting`.
    pub fn supersede(
        &self,
        peer_id: PeerId,
        superseded: TransportHandle,
        role: Role,
        handle: TransportHandle,
        slot: &IdentitySlot,
    ) -> SessionRef {
        let mut inner = self.lock();

        match inner.sessions.get(&peer_id).cloned() {
            Some(current) if current.is_open() && current.handle() != superseded => {
                tracing::debug!(
                    peer = %peer_id,
                    current = %current.handle(),
                    expected = %superseded,
                    "session changed, not superseding"
                );
                return current;
            }
            Some(current) => {
                tracing::info!(
                    peer = %peer_id,
                    old = %current.handle(),
                    new = %handle,
                    ?role,
                    slot = slot.slot_index,
                    "superseding session"
                );
            }
            None => inner.order.push(peer_id.clone()),
        }

        self.install(&mut inner, peer_id, role, handle, slot)
    }

    fn install(
        &self,
        inner: &mut Inner,
        peer_id: PeerId,
        role: Role,
        handle: TransportHandle,
        slot: &IdentitySlot,
    ) -> SessionRef {
        let session: SessionRef = Arc::new(LinkSession::new(peer_id.clone(), role, handle, slot));
        inner.sessions.insert(peer_id, session.clone());
        self.publish(inner);
        session
    }

    pub fn mark_connected(&self, peer_id: &PeerId) -> Result<(), SessionError> {
        self.transition(peer_id, None, LinkState::Connected).map(|_| ())
    }

    /// The session is kept for history; sends fail until it is superseded.
    pub fn mark_disconnected(&self, peer_id: &PeerId) -> Result<(), SessionError> {
        self.transition(peer_id, None, LinkState::Disconnected)
            .map(|_| ())
    }

    /// Apply a radio-reported state change for a specific link.
    ///
    /// Events for a handle that is no longer the session's current handle
    /// come from a superseded link and are ignored (`Ok(false)`).
    pub fn apply_link_state(
        &self,
        peer_id: &PeerId,
        handle: TransportHandle,
        state: ConnectionState,
    ) -> Result<bool, SessionError> {
        let next = match state {
            ConnectionState::Connected => LinkState::Connected,
            ConnectionState::Disconnected => LinkState::Disconnected,
        };
        self.transition(peer_id, Some(handle), next)
    }

    fn transition(
        &self,
        peer_id: &PeerId,
        handle: Option<TransportHandle>,
        next: LinkState,
    ) -> Result<bool, SessionError> {
        let mut inner = self.lock();

        let current = inner
            .sessions
            .get(peer_id)
            .ok_or_else(|| SessionError::UnknownPeer(peer_id.clone()))?;

        if let Some(handle) = handle {
            if current.handle() != handle {
                tracing::debug!(
                    peer = %peer_id,
                    current = %current.handle(),
                    stale = %handle,
                    "ignoring state change from superseded link"
                );
                return Ok(false);
            }
        }

        let mut updated = LinkSession::clone(current);
        if !updated.transition(next)? {
            return Ok(false);
        }

        tracing::info!(peer = %peer_id, handle = %updated.handle(), state = %next, "session state changed");
        inner.sessions.insert(peer_id.clone(), Arc::new(updated));
        self.publish(&inner);
        Ok(true)
    }

    /// Note that the peer wrote the confirmation attribute on `handle`.
    pub fn mark_confirmed(
        &self,
        peer_id: &PeerId,
        handle: TransportHandle,
    ) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let current = inner
            .sessions
            .get(peer_id)
            .ok_or_else(|| SessionError::UnknownPeer(peer_id.clone()))?;
        if current.handle() != handle {
            return Ok(());
        }
        let mut updated = LinkSession::clone(current);
        updated.record_confirmation();
        inner.sessions.insert(peer_id.clone(), Arc::new(updated));
        self.publish(&inner);
        Ok(())
    }

    pub fn find(&self, peer_id: &PeerId) -> Option<SessionRef> {
        self.lock().sessions.get(peer_id).cloned()
    }

    /// Current sessions in first-seen order.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receive a fresh snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Forget a peer entirely, history included.
    pub fn remove(&self, peer_id: &PeerId) -> Option<SessionRef> {
        let mut inner = self.lock();
        let removed = inner.sessions.remove(peer_id)?;
        inner.order.retain(|p| p != peer_id);
        self.publish(&inner);
        Some(removed)
    }

    /// Sessions that still hold a live transport handle.
    pub fn open_sessions(&self) -> Vec<SessionRef> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|p| inner.sessions.get(p))
            .filter(|s| s.is_open())
            .cloned()
            .collect()
    }

    /// Mark every open session Disconnected. Returns the sessions as they
    /// were before the change.
    pub fn disconnect_all(&self) -> Vec<SessionRef> {
        let mut inner = self.lock();
        let mut closed = Vec::new();
        for peer in inner.order.clone() {
            let Some(current) = inner.sessions.get(&peer) else {
                continue;
            };
            if !current.is_open() {
                continue;
            }
            closed.push(current.clone());
            let mut updated = LinkSession::clone(current);
            // Connecting/Connected -> Disconnected is always valid.
            let _ = updated.transition(LinkState::Disconnected);
            inner.sessions.insert(peer, Arc::new(updated));
        }
        if !closed.is_empty() {
            self.publish(&inner);
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.state() == LinkState::Connected)
            .count()
    }
}
