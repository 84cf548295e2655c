//! blechatd: multi-slot BLE chat node, running on the loopback radio with
//! simulated peers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use blechat_core::config::BlechatConfig;
use blechat_core::PeerId;
use blechat_services::{
    event_channel, ChatNode, LoopbackAir, LoopbackRadio, NodeConfig, NodeError,
};

mod sim;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    if let Err(e) = BlechatConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BlechatConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BlechatConfig::default()
    });
    let registry = config
        .identity_registry()
        .context("invalid [[slots]] configuration")?;

    let local = PeerId::new(&config.radio.address);
    tracing::info!(address = %local, slots = registry.len(), "blechatd starting");

    // Radio and node
    let air = LoopbackAir::new();
    let (events_tx, events_rx) = event_channel();
    let radio = LoopbackRadio::attach(&air, local.clone(), events_tx);
    let node = ChatNode::new(
        NodeConfig::from_config(&config),
        registry.clone(),
        Arc::new(radio),
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let pump_task = tokio::spawn(node.event_pump(events_rx, shutdown_tx.subscribe()).run());

    match node.start().await {
        Ok(()) => tracing::info!(slots = ?node.listening_slots(), "listening on all slots"),
        Err(NodeError::Listeners(e)) => {
            tracing::warn!(error = %e, listening = ?node.listening_slots(), "some slots failed to open")
        }
        Err(e) => tracing::warn!(error = %e, "node not started"),
    }

    let _sim_tasks = sim::spawn_peers(&air, &config, &registry, &local, &shutdown_tx);

    let session_printer = config.api.snapshot_interval().map(|every| {
        let sessions = node.sessions().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let snapshot = sessions.snapshot();
                tracing::info!(count = snapshot.len(), "session table snapshot");
                for s in snapshot.iter() {
                    tracing::info!(
                        peer = %s.peer_id(),
                        slot = s.slot_index(),
                        state = %s.state(),
                        handle = %s.handle(),
                        "  session"
                    );
                }
            }
        })
    });

    let message_printer = {
        let mut messages = node.subscribe_messages();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(m) => tracing::info!(
                        peer = %m.peer_id,
                        slot = m.slot_index,
                        origin = ?m.origin,
                        text = %m.text,
                        "message"
                    ),
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "message log lagging"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    // Status HTTP endpoint
    let api_task = {
        let state = blechat_api::ApiState {
            node: node.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = blechat_api::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = pump_task           => tracing::error!("event pump exited: {:?}", r),
        r = async {
            match session_printer {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        }                       => tracing::error!("session printer exited: {:?}", r),
        r = message_printer     => tracing::error!("message printer exited: {:?}", r),
        r = api_task            => tracing::error!("status server exited: {:?}", r),
    }

    if let Err(e) = node.stop().await {
        tracing::warn!(error = %e, "shutdown was not clean");
    }

    Ok(())
}
