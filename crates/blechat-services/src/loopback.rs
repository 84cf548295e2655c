//! In-process radio.
//!
//! `LoopbackAir` is the shared medium; each `LoopbackRadio` attached to it
//! is one device with its own address and event channel. Connects, writes
//! and disconnects are delivered to the other end as `TransportEvent`s, in
//! the order they were made. Used by the simulator daemon and by tests, and
//! able to inject listener, close and write failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use blechat_core::{IdentitySlot, PeerId};

use crate::transport::{
    ConnectionState, EventSender, ListenerHandle, PeerDescriptor, Transport, TransportError,
    TransportEvent, TransportHandle, WriteError,
};

struct Device {
    events: EventSender,
    enabled: bool,
    listeners: HashMap<ListenerHandle, IdentitySlot>,
    failing_listeners: HashSet<Uuid>,
    failing_close: HashSet<Uuid>,
    fail_writes: bool,
}

impl Device {
    fn emit(&self, event: TransportEvent) {
        // A device whose receiver is gone just stops hearing.
        let _ = self.events.send(event);
    }

    fn listening_on(&self, service_id: &Uuid) -> Option<&IdentitySlot> {
        self.listeners.values().find(|s| &s.service_id == service_id)
    }
}

/// One end of a link, keyed by its own handle.
#[derive(Clone)]
struct LinkEnd {
    owner: PeerId,
    remote: PeerId,
    remote_handle: TransportHandle,
}

#[derive(Default)]
struct AirState {
    next_id: u64,
    devices: HashMap<PeerId, Device>,
    links: HashMap<TransportHandle, LinkEnd>,
}

impl AirState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Remove both ends of a link and tell both devices.
    fn drop_link(&mut self, handle: TransportHandle) -> Option<LinkEnd> {
        let end = self.links.remove(&handle)?;
        self.links.remove(&end.remote_handle);

        if let Some(device) = self.devices.get(&end.owner) {
            device.emit(TransportEvent::ConnectionStateChanged {
                peer_id: end.remote.clone(),
                handle,
                state: ConnectionState::Disconnected,
            });
        }
        if let Some(device) = self.devices.get(&end.remote) {
            device.emit(TransportEvent::ConnectionStateChanged {
                peer_id: end.owner.clone(),
                handle: end.remote_handle,
                state: ConnectionState::Disconnected,
            });
        }
        tracing::debug!(local = %end.owner, remote = %end.remote, %handle, "loopback link dropped");
        Some(end)
    }
}

/// Shared in-process medium. Clones share the same air.
#[derive(Clone, Default)]
pub struct LoopbackAir {
    state: Arc<Mutex<AirState>>,
}

impl LoopbackAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live links, counting each link once.
    pub fn link_count(&self) -> usize {
        self.lock().links.len() / 2
    }

    /// Addresses of every attached device.
    pub fn devices(&self) -> Vec<PeerId> {
        self.lock().devices.keys().cloned().collect()
    }
}

/// One device on the air.
#[derive(Clone)]
pub struct LoopbackRadio {
    air: LoopbackAir,
    address: PeerId,
}

impl LoopbackRadio {
    /// Put a powered-on device with `address` on the air. Its events are
    /// delivered on `events`. Attaching the same address again replaces the
    /// previous device.
    pub fn attach(air: &LoopbackAir, address: PeerId, events: EventSender) -> Self {
        let mut state = air.lock();
        let stale: Vec<TransportHandle> = state
            .links
            .iter()
            .filter(|(_, end)| end.owner == address)
            .map(|(h, _)| *h)
            .collect();
        for handle in stale {
            state.drop_link(handle);
        }
        state.devices.insert(
            address.clone(),
            Device {
                events,
                enabled: true,
                listeners: HashMap::new(),
                failing_listeners: HashSet::new(),
                failing_close: HashSet::new(),
                fail_writes: false,
            },
        );
        drop(state);

        tracing::debug!(%address, "loopback radio attached");
        Self {
            air: air.clone(),
            address,
        }
    }

    pub fn address(&self) -> &PeerId {
        &self.address
    }

    fn with_device<T>(&self, f: impl FnOnce(&mut Device) -> T) -> Option<T> {
        self.air.lock().devices.get_mut(&self.address).map(f)
    }

    /// Power the radio on or off. Powering off drops every link and
    /// listener this device holds.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.air.lock();
        let Some(device) = state.devices.get_mut(&self.address) else {
            return;
        };
        if device.enabled == enabled {
            return;
        }
        device.enabled = enabled;
        if !enabled {
            device.listeners.clear();
        }
        device.emit(TransportEvent::RadioStateChanged { enabled });

        if !enabled {
            let owned: Vec<TransportHandle> = state
                .links
                .iter()
                .filter(|(_, end)| end.owner == self.address)
                .map(|(h, _)| *h)
                .collect();
            for handle in owned {
                state.drop_link(handle);
            }
        }
        tracing::info!(address = %self.address, enabled, "loopback radio power changed");
    }

    /// Drop a link as if the peer walked out of range.
    pub fn sever(&self, handle: TransportHandle) -> bool {
        let mut state = self.air.lock();
        let owned = state
            .links
            .get(&handle)
            .is_some_and(|end| end.owner == self.address);
        owned && state.drop_link(handle).is_some()
    }

    /// Make `open_listener` fail for this service until cleared.
    pub fn fail_listener(&self, service_id: Uuid) {
        self.with_device(|d| d.failing_listeners.insert(service_id));
    }

    /// Make `close_listener` fail for listeners on this service.
    pub fn fail_close(&self, service_id: Uuid) {
        self.with_device(|d| d.failing_close.insert(service_id));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.with_device(|d| d.fail_writes = fail);
    }

    /// Handles of the links this device currently holds.
    pub fn links(&self) -> Vec<TransportHandle> {
        let state = self.air.lock();
        let mut handles: Vec<_> = state
            .links
            .iter()
            .filter(|(_, end)| end.owner == self.address)
            .map(|(h, _)| *h)
            .collect();
        handles.sort_by_key(|h| h.0);
        handles
    }
}

#[async_trait]
impl Transport for LoopbackRadio {
    fn radio_enabled(&self) -> bool {
        self.with_device(|d| d.enabled).unwrap_or(false)
    }

    fn local_address(&self) -> PeerId {
        self.address.clone()
    }

    async fn open_listener(&self, slot: &IdentitySlot) -> Result<ListenerHandle, TransportError> {
        let mut state = self.air.lock();
        let id = state.next_id();
        let device = state
            .devices
            .get_mut(&self.address)
            .ok_or(TransportError::RadioDisabled)?;
        if !device.enabled {
            return Err(TransportError::RadioDisabled);
        }
        if device.failing_listeners.contains(&slot.service_id) {
            let reason = format!("advertising {} rejected", slot.service_id);
            device.emit(TransportEvent::AdvertiseFailed {
                slot_index: slot.slot_index,
                reason: reason.clone(),
            });
            return Err(TransportError::Refused(reason));
        }

        let handle = ListenerHandle(id);
        device.listeners.insert(handle, *slot);
        Ok(handle)
    }

    async fn close_listener(&self, listener: ListenerHandle) -> Result<(), TransportError> {
        let mut state = self.air.lock();
        let device = state
            .devices
            .get_mut(&self.address)
            .ok_or(TransportError::UnknownListener(listener))?;
        let slot = device
            .listeners
            .get(&listener)
            .copied()
            .ok_or(TransportError::UnknownListener(listener))?;
        if device.failing_close.contains(&slot.service_id) {
            return Err(TransportError::Refused(format!(
                "stop advertising {} rejected",
                slot.service_id
            )));
        }
        device.listeners.remove(&listener);
        Ok(())
    }

    async fn connect(&self, peer: &PeerDescriptor) -> Result<TransportHandle, TransportError> {
        let mut state = self.air.lock();

        match state.devices.get(&self.address) {
            Some(d) if d.enabled => {}
            _ => return Err(TransportError::RadioDisabled),
        }
        let remote_slot = state
            .devices
            .get(&peer.peer_id)
            .filter(|d| d.enabled && peer.peer_id != self.address)
            .and_then(|d| d.listening_on(&peer.slot.service_id))
            .copied()
            .ok_or_else(|| TransportError::PeerUnreachable(peer.peer_id.clone()))?;

        let local = TransportHandle(state.next_id());
        let remote = TransportHandle(state.next_id());
        state.links.insert(
            local,
            LinkEnd {
                owner: self.address.clone(),
                remote: peer.peer_id.clone(),
                remote_handle: remote,
            },
        );
        state.links.insert(
            remote,
            LinkEnd {
                owner: peer.peer_id.clone(),
                remote: self.address.clone(),
                remote_handle: local,
            },
        );

        if let Some(device) = state.devices.get(&peer.peer_id) {
            device.emit(TransportEvent::InboundConnection {
                slot_index: remote_slot.slot_index,
                peer_id: self.address.clone(),
                handle: remote,
            });
            device.emit(TransportEvent::ConnectionStateChanged {
                peer_id: self.address.clone(),
                handle: remote,
                state: ConnectionState::Connected,
            });
        }
        tracing::debug!(local = %self.address, remote = %peer.peer_id, handle = %local, "loopback link up");
        Ok(local)
    }

    async fn write(
        &self,
        handle: TransportHandle,
        attribute_id: Uuid,
        payload: Bytes,
    ) -> Result<(), WriteError> {
        let state = self.air.lock();
        match state.devices.get(&self.address) {
            Some(d) if d.fail_writes => return Err(WriteError::Rejected("radio busy".into())),
            Some(d) if d.enabled => {}
            _ => return Err(WriteError::LinkClosed(handle)),
        }
        let end = state
            .links
            .get(&handle)
            .filter(|end| end.owner == self.address)
            .ok_or(WriteError::LinkClosed(handle))?;

        if let Some(remote) = state.devices.get(&end.remote) {
            remote.emit(TransportEvent::InboundWrite {
                peer_id: self.address.clone(),
                handle: end.remote_handle,
                attribute_id,
                payload,
            });
        }
        Ok(())
    }

    async fn disconnect(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let mut state = self.air.lock();
        let owned = state
            .links
            .get(&handle)
            .is_some_and(|end| end.owner == self.address);
        if !owned {
            return Err(TransportError::UnknownHandle(handle));
        }
        state.drop_link(handle);
        Ok(())
    }
}
