//! Messaging between devices: delivery, slot attribution, bad payloads,
//! and sends on dropped links.

use anyhow::Result;
use bytes::Bytes;

use blechat_core::{Origin, PeerId};
use blechat_services::{LinkState, LoopbackAir, SendError, Transport};

use crate::*;

const LOCAL: &str = "02:00:00:00:00:00";

#[tokio::test]
async fn test_message_round_trip_on_slot() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);
    let mut local_rx = local.node.subscribe_messages();
    let mut a_rx = a.node.subscribe_messages();

    a.node.connect_slot(local_id.clone(), 2).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;

    let sent = a.node.send(&local_id, "hello").await?;
    assert_eq!(sent.origin, Origin::Local);
    assert_eq!(a_rx.recv().await?, sent);

    let got = tokio::time::timeout(WAIT, local_rx.recv()).await??;
    assert_eq!(got.origin, Origin::Remote);
    assert_eq!(got.text, "hello");
    assert_eq!(got.peer_id, a.address);
    assert_eq!(got.slot_index, 2);

    local.node.send(&a.address, "hi back").await?;
    let reply = tokio::time::timeout(WAIT, a_rx.recv()).await??;
    assert_eq!(reply.origin, Origin::Remote);
    assert_eq!(reply.text, "hi back");

    assert_eq!(local.node.store().count(&a.address), 2);

    a.shutdown().await?;
    local.shutdown().await
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);
    let mut local_rx = local.node.subscribe_messages();

    a.node.connect_slot(local_id.clone(), 0).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;

    for i in 0..20 {
        a.node.send(&local_id, &format!("m{i}")).await?;
    }
    for i in 0..20 {
        let m = tokio::time::timeout(WAIT, local_rx.recv()).await??;
        assert_eq!(m.text, format!("m{i}"));
    }

    a.shutdown().await?;
    local.shutdown().await
}

/// Bytes that are not UTF-8 are dropped; the link stays up and later
/// messages still arrive.
#[tokio::test]
async fn test_invalid_utf8_keeps_session() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);
    let mut local_rx = local.node.subscribe_messages();

    let link = a.node.connect_slot(local_id.clone(), 1).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;

    a.radio
        .write(
            link.handle(),
            link.message_attr_id(),
            Bytes::from_static(&[0xc3, 0x28, 0xff]),
        )
        .await?;
    a.node.send(&local_id, "after").await?;

    let m = tokio::time::timeout(WAIT, local_rx.recv()).await??;
    assert_eq!(m.text, "after");
    assert_eq!(
        local.session(&a.address).unwrap().state(),
        LinkState::Connected
    );
    assert_eq!(local.node.store().count(&a.address), 1);

    a.shutdown().await?;
    local.shutdown().await
}

/// Writes on another slot's attribute and confirmation writes produce no
/// message.
#[tokio::test]
async fn test_foreign_and_confirm_attributes_emit_nothing() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);
    let mut local_rx = local.node.subscribe_messages();

    let link = a.node.connect_slot(local_id.clone(), 0).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;

    let other_slot = a.node.registry().slots()[1];
    a.radio
        .write(link.handle(), other_slot.message_attr_id, Bytes::from_static(b"stray"))
        .await?;
    a.radio
        .write(link.handle(), link.confirm_attr_id(), Bytes::new())
        .await?;

    wait_until(|| {
        local
            .session(&a.address)
            .is_some_and(|s| s.since_confirmed().is_some())
    })
    .await?;
    assert!(local_rx.try_recv().is_err());

    a.shutdown().await?;
    local.shutdown().await
}

#[tokio::test]
async fn test_send_after_drop_fails_until_reconnected() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);

    let link = a.node.connect_slot(local_id.clone(), 0).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;
    a.radio.sever(link.handle());
    local.wait_for_state(&a.address, LinkState::Disconnected).await?;
    a.wait_for_state(&local_id, LinkState::Disconnected).await?;

    assert!(matches!(
        local.node.send(&a.address, "anyone?").await,
        Err(SendError::NotConnected(_))
    ));
    assert!(matches!(
        local.node.send(&PeerId::new("EE:EE"), "nobody").await,
        Err(SendError::UnknownPeer(_))
    ));

    a.node.connect_slot(local_id.clone(), 0).await?;
    local.wait_for_state(&a.address, LinkState::Connected).await?;
    local.node.send(&a.address, "welcome back").await?;

    a.shutdown().await?;
    local.shutdown().await
}

#[tokio::test]
async fn test_write_failure_is_reported() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, LOCAL).await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let local_id = PeerId::new(LOCAL);

    a.node.connect_slot(local_id.clone(), 0).await?;
    a.radio.fail_writes(true);

    assert!(matches!(
        a.node.send(&local_id, "lost").await,
        Err(SendError::TransportWriteFailed(_))
    ));
    assert_eq!(a.node.store().count(&local_id), 0);

    a.radio.fail_writes(false);
    a.node.send(&local_id, "found").await?;

    a.shutdown().await?;
    local.shutdown().await
}
