//! Chat node: the session table, router, listener manager and message
//! store wired around one transport, plus the task that feeds transport
//! events into them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use blechat_core::config::BlechatConfig;
use blechat_core::{IdentityRegistry, Message, PeerId};

use crate::link::SendError;
use crate::listener::{ConnectError, ListenerErrors, ListenerManager};
use crate::message_store::MessageStore;
use crate::router::MessageRouter;
use crate::session::{SessionRef, SessionSnapshot, SessionTable};
use crate::transport::{
    ConnectionState, EventReceiver, PeerDescriptor, Transport, TransportError, TransportEvent,
};

/// Runtime knobs derived from `BlechatConfig`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub open_timeout: Duration,
    pub connect_timeout: Duration,
    pub history_limit: usize,
    pub channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_config(&BlechatConfig::default())
    }
}

impl NodeConfig {
    pub fn from_config(config: &BlechatConfig) -> Self {
        Self {
            open_timeout: config.radio.open_timeout(),
            connect_timeout: config.radio.connect_timeout(),
            history_limit: config.messaging.history_limit,
            channel_capacity: config.messaging.channel_capacity,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("radio is disabled")]
    RadioDisabled,
    #[error(transparent)]
    Listeners(#[from] ListenerErrors),
}

/// Everything one device needs to chat. Clones share state.
#[derive(Clone)]
pub struct ChatNode {
    registry: IdentityRegistry,
    transport: Arc<dyn Transport>,
    sessions: SessionTable,
    router: MessageRouter,
    listeners: ListenerManager,
    radio: Arc<watch::Sender<bool>>,
}

impl ChatNode {
    pub fn new(config: NodeConfig, registry: IdentityRegistry, transport: Arc<dyn Transport>) -> Self {
        let sessions = SessionTable::new();
        let router = MessageRouter::new(
            sessions.clone(),
            registry.clone(),
            transport.clone(),
            MessageStore::new(config.history_limit),
            config.channel_capacity,
        );
        let listeners = ListenerManager::new(
            registry.clone(),
            transport.clone(),
            sessions.clone(),
            config.open_timeout,
            config.connect_timeout,
        );
        let (radio, _) = watch::channel(transport.radio_enabled());

        Self {
            registry,
            transport,
            sessions,
            router,
            listeners,
            radio: Arc::new(radio),
        }
    }

    /// Open listeners on every slot.
    ///
    /// With the radio off nothing is opened; the radio flag is published
    /// as `false` so a front end can ask the user to turn it on.
    pub async fn start(&self) -> Result<(), NodeError> {
        if !self.transport.radio_enabled() {
            self.radio.send_replace(false);
            tracing::warn!("radio is disabled, not listening");
            return Err(NodeError::RadioDisabled);
        }
        self.radio.send_replace(true);
        self.listeners.start_all().await?;
        Ok(())
    }

    /// Close all listeners and links. Safe to call more than once.
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.listeners.stop_all().await?;
        Ok(())
    }

    pub async fn connect_to(&self, peer: PeerDescriptor) -> Result<SessionRef, ConnectError> {
        self.listeners.connect_to(peer).await
    }

    /// Dial `peer_id` on the slot with `slot_index`.
    pub async fn connect_slot(
        &self,
        peer_id: PeerId,
        slot_index: usize,
    ) -> Result<SessionRef, ConnectError> {
        let slot = *self
            .registry
            .slot(slot_index)
            .ok_or(ConnectError::UnknownSlot(slot_index))?;
        self.connect_to(PeerDescriptor { peer_id, slot }).await
    }

    pub async fn send(&self, peer_id: &PeerId, text: &str) -> Result<Message, SendError> {
        self.router.send(peer_id, text).await
    }

    /// Close the peer's live link. Returns `false` when there was none.
    pub async fn disconnect_peer(&self, peer_id: &PeerId) -> Result<bool, TransportError> {
        let Some(session) = self.sessions.find(peer_id).filter(|s| s.is_open()) else {
            return Ok(false);
        };
        let handle = session.handle();
        match self.transport.disconnect(handle).await {
            Ok(()) | Err(TransportError::UnknownHandle(_)) => {}
            Err(e) => return Err(e),
        }
        let _ = self
            .sessions
            .apply_link_state(peer_id, handle, ConnectionState::Disconnected);
        tracing::info!(peer = %peer_id, %handle, "peer disconnected on request");
        Ok(true)
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn store(&self) -> &MessageStore {
        self.router.store()
    }

    pub fn listening_slots(&self) -> Vec<usize> {
        self.listeners.listening_slots()
    }

    pub fn radio_enabled(&self) -> watch::Receiver<bool> {
        self.radio.subscribe()
    }

    pub fn subscribe_sessions(&self) -> watch::Receiver<SessionSnapshot> {
        self.sessions.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.router.subscribe()
    }

    /// Build the task that applies this node's transport events.
    pub fn event_pump(&self, events: EventReceiver, shutdown: broadcast::Receiver<()>) -> EventPump {
        EventPump::new(self.clone(), events, shutdown)
    }
}

/// Applies transport events to a node, one at a time, in arrival order.
pub struct EventPump {
    node: ChatNode,
    events: EventReceiver,
    shutdown: broadcast::Receiver<()>,
}

impl EventPump {
    pub fn new(node: ChatNode, events: EventReceiver, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            node,
            events,
            shutdown,
        }
    }

    /// Run until shutdown is signalled or the radio drops its sender.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => Self::handle(&self.node, event).await,
                    None => {
                        tracing::info!("transport event channel closed");
                        break;
                    }
                },
                _ = self.shutdown.recv() => {
                    tracing::info!("event pump shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(node: &ChatNode, event: TransportEvent) {
        match event {
            TransportEvent::InboundConnection {
                slot_index,
                peer_id,
                handle,
            } => {
                if let Err(e) = node
                    .listeners
                    .accept_inbound(slot_index, peer_id.clone(), handle)
                    .await
                {
                    tracing::warn!(peer = %peer_id, slot = slot_index, %handle, error = %e, "inbound connection rejected");
                    let _ = node.transport.disconnect(handle).await;
                }
            }

            TransportEvent::ConnectionStateChanged {
                peer_id,
                handle,
                state,
            } => {
                if let Err(e) = node.sessions.apply_link_state(&peer_id, handle, state) {
                    tracing::warn!(peer = %peer_id, %handle, ?state, error = %e, "link state change dropped");
                }
            }

            TransportEvent::InboundWrite {
                peer_id,
                handle,
                attribute_id,
                payload,
            } => {
                let current = node.sessions.find(&peer_id).map(|s| s.handle());
                if current.is_some_and(|h| h != handle) {
                    tracing::debug!(peer = %peer_id, stale = %handle, "write on superseded link dropped");
                    return;
                }
                if let Err(e) = node.router.on_inbound(&peer_id, attribute_id, &payload) {
                    tracing::warn!(peer = %peer_id, %handle, error = %e, "inbound write dropped");
                }
            }

            TransportEvent::AdvertiseFailed { slot_index, reason } => {
                tracing::warn!(slot = slot_index, %reason, "advertising failed");
            }

            TransportEvent::RadioStateChanged { enabled } => {
                tracing::info!(enabled, "radio state changed");
                node.radio.send_replace(enabled);
                if !enabled {
                    // A powered-off radio has already dropped its listeners.
                    node.listeners.forget_all();
                } else {
                    if let Err(e) = node.listeners.start_all().await {
                        tracing::warn!(error = %e, "relisten after radio enable failed");
                    }
                }
            }
        }
    }
}
