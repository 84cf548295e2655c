//! Session lifecycle across devices: multi-slot connects, drops,
//! reconnects and superseded links.

use anyhow::Result;

use blechat_core::{Origin, PeerId};
use blechat_services::{ConnectionState, LinkState, LoopbackAir, Role, SessionSnapshot};

use crate::*;

const LOCAL: &str = "02:00:00:00:00:00";

/// Peers on different slots share one table; a drop affects only the
/// dropped peer, and a reconnect reuses the peer's entry.
#[tokio::test]
async fn test_two_peers_on_two_slots_drop_and_reconnect() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let b = Device::attach(&air, "0B:00:00:00:00:02");
    let local_id = PeerId::new(LOCAL);

    let (ra, rb) = tokio::join!(
        a.node.connect_slot(local_id.clone(), 0),
        b.node.connect_slot(local_id.clone(), 1),
    );
    let a_link = ra?;
    rb?;

    local.wait_for_state(&a.address, LinkState::Connected).await?;
    local.wait_for_state(&b.address, LinkState::Connected).await?;
    let snapshot = local.node.sessions().snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|s| s.state() == LinkState::Connected));
    assert!(snapshot.iter().all(|s| s.role() == Role::Server));
    assert_eq!(local.session(&a.address).unwrap().slot_index(), 0);
    assert_eq!(local.session(&b.address).unwrap().slot_index(), 1);

    // A walks out of range.
    let b_before = local.session(&b.address).unwrap();
    assert!(a.radio.sever(a_link.handle()));
    local.wait_for_state(&a.address, LinkState::Disconnected).await?;
    a.wait_for_state(&local_id, LinkState::Disconnected).await?;
    let b_after = local.session(&b.address).unwrap();
    assert_eq!(b_after.state(), LinkState::Connected);
    assert_eq!(b_after.handle(), b_before.handle());

    // A comes back on the same slot.
    let old_handle = local.session(&a.address).unwrap().handle();
    let position = |table: &SessionSnapshot| {
        table.iter().position(|s| s.peer_id() == &a.address)
    };
    let a_position = position(&local.node.sessions().snapshot());
    a.node.connect_slot(local_id.clone(), 0).await?;
    let fresh = local.wait_for_state(&a.address, LinkState::Connected).await?;
    assert_ne!(fresh.handle(), old_handle);
    assert_eq!(local.node.sessions().len(), 2);
    assert_eq!(position(&local.node.sessions().snapshot()), a_position);

    a.shutdown().await?;
    b.shutdown().await?;
    local.shutdown().await
}

/// Both sides dialing each other at once agree on one surviving link, the
/// one dialed by the lower address, and can chat over it.
#[tokio::test]
async fn test_crossed_connects_keep_one_live_link() -> Result<()> {
    let air = LoopbackAir::new();
    let x = Device::listening(&air, "0C:00:00:00:00:01").await?;
    let y = Device::listening(&air, "0C:00:00:00:00:02").await?;
    let mut x_rx = x.node.subscribe_messages();
    let mut y_rx = y.node.subscribe_messages();

    let (rx, ry) = tokio::join!(
        x.node.connect_slot(y.address.clone(), 0),
        y.node.connect_slot(x.address.clone(), 2),
    );
    rx?;
    ry?;

    let live = |device: &Device, peer: &PeerId| {
        device.session(peer).is_some_and(|s| {
            s.state() == LinkState::Connected && device.radio.links() == vec![s.handle()]
        })
    };
    wait_until(|| air.link_count() == 1 && live(&x, &y.address) && live(&y, &x.address)).await?;
    assert_eq!(x.node.sessions().len(), 1);
    assert_eq!(y.node.sessions().len(), 1);
    assert_eq!(x.session(&y.address).unwrap().role(), Role::Client);
    assert_eq!(y.session(&x.address).unwrap().role(), Role::Server);

    x.node.send(&y.address, "ping").await?;
    let got = tokio::time::timeout(WAIT, y_rx.recv()).await??;
    assert_eq!(got.text, "ping");
    assert_eq!(got.peer_id, x.address);

    y.node.send(&x.address, "pong").await?;
    let got = loop {
        let m = tokio::time::timeout(WAIT, x_rx.recv()).await??;
        if m.origin == Origin::Remote {
            break m;
        }
    };
    assert_eq!(got.text, "pong");

    x.shutdown().await?;
    y.shutdown().await
}

/// Many peers connecting at once each get exactly one entry.
#[tokio::test]
async fn test_concurrent_peers_each_get_one_entry() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let peers: Vec<Device> = (0..8)
        .map(|i| Device::attach(&air, &format!("0D:00:00:00:00:{i:02X}")))
        .collect();

    let mut tasks = Vec::new();
    for (i, peer) in peers.iter().enumerate() {
        let node = peer.node.clone();
        let target = PeerId::new(LOCAL);
        tasks.push(tokio::spawn(async move {
            node.connect_slot(target, i % 3).await
        }));
    }
    for task in tasks {
        task.await??;
    }

    wait_until(|| local.node.sessions().connected_count() == peers.len()).await?;
    assert_eq!(local.node.sessions().len(), peers.len());

    for peer in peers {
        peer.shutdown().await?;
    }
    local.shutdown().await
}

/// A disconnect reported for a superseded link does not touch the session
/// that replaced it.
#[tokio::test]
async fn test_stale_disconnect_is_ignored() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);

    let first = a.node.connect_slot(local_id.clone(), 1).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;
    a.radio.sever(first.handle());
    local.wait_for_state(&a.address, LinkState::Disconnected).await?;
    a.wait_for_state(&local_id, LinkState::Disconnected).await?;

    let second = a.node.connect_slot(local_id.clone(), 1).await?;
    assert_ne!(second.handle(), first.handle());
    local.wait_for_state(&a.address, LinkState::Connected).await?;

    // Severing the old link again is a no-op on the air and the table.
    assert!(!a.radio.sever(first.handle()));
    let changed = a.node.sessions().apply_link_state(
        &local_id,
        first.handle(),
        ConnectionState::Disconnected,
    )?;
    assert!(!changed);
    assert_eq!(
        a.session(&local_id).unwrap().state(),
        LinkState::Connected
    );

    a.shutdown().await?;
    local.shutdown().await
}

/// Stopping a node closes its links; peers see the drop.
#[tokio::test]
async fn test_stop_disconnects_peers() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);

    a.node.connect_slot(local_id.clone(), 2).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;

    local.node.stop().await?;
    assert_eq!(
        local.session(&a.address).unwrap().state(),
        LinkState::Disconnected
    );
    a.wait_for_state(&local_id, LinkState::Disconnected).await?;
    assert_eq!(air.link_count(), 0);
    assert!(local.node.listening_slots().is_empty());

    a.shutdown().await?;
    local.shutdown().await
}
