//! Simulated peers sharing the loopback air with the local device.
//!
//! Each peer is a full chat node on its own radio. It listens on every
//! slot, dials the local device on slot `i % slots`, and optionally echoes
//! back whatever it receives.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use blechat_core::config::BlechatConfig;
use blechat_core::{IdentityRegistry, Message, PeerId};
use blechat_services::{event_channel, ChatNode, LoopbackAir, LoopbackRadio, NodeConfig};

pub struct SimPeer {
    node: ChatNode,
    local: PeerId,
    slot_index: usize,
    echo: bool,
    messages: broadcast::Receiver<Message>,
    shutdown: broadcast::Receiver<()>,
}

impl SimPeer {
    pub fn new(
        node: ChatNode,
        local: PeerId,
        slot_index: usize,
        echo: bool,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let messages = node.subscribe_messages();
        Self {
            node,
            local,
            slot_index,
            echo,
            messages,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        if let Err(e) = self.node.start().await {
            tracing::warn!(error = %e, "sim peer could not listen on every slot");
        }
        match self.node.connect_slot(self.local.clone(), self.slot_index).await {
            Ok(s) => tracing::info!(peer = %self.local, slot = s.slot_index(), "sim peer linked"),
            Err(e) => tracing::warn!(peer = %self.local, error = %e, "sim peer connect failed"),
        }

        loop {
            tokio::select! {
                msg = self.messages.recv() => match msg {
                    Ok(msg) if msg.is_remote() && self.echo => {
                        let reply = format!("echo: {}", msg.text);
                        if let Err(e) = self.node.send(&msg.peer_id, &reply).await {
                            tracing::warn!(peer = %msg.peer_id, error = %e, "sim echo failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "sim peer lagging"),
                    Err(RecvError::Closed) => break,
                },
                _ = self.shutdown.recv() => break,
            }
        }

        if let Err(e) = self.node.stop().await {
            tracing::debug!(error = %e, "sim peer stop");
        }
    }
}

/// Attach one radio per configured sim peer and spawn its pump and driver.
pub fn spawn_peers(
    air: &LoopbackAir,
    config: &BlechatConfig,
    registry: &IdentityRegistry,
    local: &PeerId,
    shutdown_tx: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    for (i, address) in config.sim.peers.iter().enumerate() {
        let address = PeerId::new(address);
        if &address == local {
            tracing::warn!(%address, "sim peer shares the local address, skipping");
            continue;
        }

        let (events_tx, events_rx) = event_channel();
        let radio = LoopbackRadio::attach(air, address.clone(), events_tx);
        let node = ChatNode::new(
            NodeConfig::from_config(config),
            registry.clone(),
            Arc::new(radio),
        );
        let slot_index = registry.slots()[i % registry.len()].slot_index;

        tracing::info!(%address, slot = slot_index, echo = config.sim.echo, "sim peer attached");
        tasks.push(tokio::spawn(
            node.event_pump(events_rx, shutdown_tx.subscribe()).run(),
        ));
        tasks.push(tokio::spawn(
            SimPeer::new(
                node,
                local.clone(),
                slot_index,
                config.sim.echo,
                shutdown_tx.subscribe(),
            )
            .run(),
        ));
    }

    tasks
}
