//! Recording transport for unit tests. Every call is logged; failures are
//! switched on per service id or globally.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use uuid::Uuid;

use blechat_core::{IdentitySlot, PeerId};

use crate::transport::{
    ListenerHandle, PeerDescriptor, Transport, TransportError, TransportHandle, WriteError,
};

pub struct RecordingTransport {
    address: PeerId,
    enabled: AtomicBool,
    fail_writes: AtomicBool,
    next_id: AtomicU64,
    failing_open: Mutex<HashSet<Uuid>>,
    hanging_open: Mutex<HashSet<Uuid>>,
    failing_close: Mutex<HashSet<ListenerHandle>>,
    unreachable: Mutex<HashSet<PeerId>>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    opened: Mutex<Vec<(ListenerHandle, Uuid)>>,
    closed: Mutex<Vec<ListenerHandle>>,
    connects: Mutex<Vec<PeerId>>,
    disconnects: Mutex<Vec<TransportHandle>>,
    writes: Mutex<Vec<(TransportHandle, Uuid, Bytes)>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            address: PeerId::new("02:00:00:00:00:00"),
            enabled: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            next_id: AtomicU64::new(100),
            failing_open: Mutex::default(),
            hanging_open: Mutex::default(),
            failing_close: Mutex::default(),
            unreachable: Mutex::default(),
            connect_gate: Mutex::default(),
            opened: Mutex::default(),
            closed: Mutex::default(),
            connects: Mutex::default(),
            disconnects: Mutex::default(),
            writes: Mutex::default(),
        }
    }
}

impl RecordingTransport {
    pub fn with_address(address: &str) -> Self {
        Self {
            address: PeerId::new(address),
            ..Self::default()
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_open(&self, service_id: Uuid) {
        self.failing_open.lock().unwrap().insert(service_id);
    }

    /// `open_listener` for this service never resolves.
    pub fn hang_open(&self, service_id: Uuid) {
        self.hanging_open.lock().unwrap().insert(service_id);
    }

    pub fn fail_close(&self, listener: ListenerHandle) {
        self.failing_close.lock().unwrap().insert(listener);
    }

    pub fn set_unreachable(&self, peer: PeerId) {
        self.unreachable.lock().unwrap().insert(peer);
    }

    /// Every later `connect` waits for a permit on the returned gate.
    pub fn hold_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn opened(&self) -> Vec<(ListenerHandle, Uuid)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<ListenerHandle> {
        self.closed.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<PeerId> {
        self.connects.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<TransportHandle> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(TransportHandle, Uuid, Bytes)> {
        self.writes.lock().unwrap().clone()
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn radio_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn local_address(&self) -> PeerId {
        self.address.clone()
    }

    async fn open_listener(&self, slot: &IdentitySlot) -> Result<ListenerHandle, TransportError> {
        if self.hanging_open.lock().unwrap().contains(&slot.service_id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing_open.lock().unwrap().contains(&slot.service_id) {
            return Err(TransportError::Refused("advertise failed".into()));
        }
        let handle = ListenerHandle(self.next());
        self.opened.lock().unwrap().push((handle, slot.service_id));
        Ok(handle)
    }

    async fn close_listener(&self, listener: ListenerHandle) -> Result<(), TransportError> {
        self.closed.lock().unwrap().push(listener);
        if self.failing_close.lock().unwrap().contains(&listener) {
            return Err(TransportError::UnknownListener(listener));
        }
        Ok(())
    }

    async fn connect(&self, peer: &PeerDescriptor) -> Result<TransportHandle, TransportError> {
        self.connects.lock().unwrap().push(peer.peer_id.clone());
        if self.unreachable.lock().unwrap().contains(&peer.peer_id) {
            return Err(TransportError::PeerUnreachable(peer.peer_id.clone()));
        }
        let gate = self.connect_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(TransportHandle(self.next()))
    }

    async fn write(
        &self,
        handle: TransportHandle,
        attribute_id: Uuid,
        payload: Bytes,
    ) -> Result<(), WriteError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WriteError::Rejected("radio busy".into()));
        }
        self.writes
            .lock()
            .unwrap()
            .push((handle, attribute_id, payload));
        Ok(())
    }

    async fn disconnect(&self, handle: TransportHandle) -> Result<(), TransportError> {
        self.disconnects.lock().unwrap().push(handle);
        Ok(())
    }
}
