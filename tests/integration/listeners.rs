//! Listener lifecycle: partial open failures, repeated stop, radio power.

use anyhow::Result;

use blechat_core::PeerId;
use blechat_services::{ConnectError, LoopbackAir, NodeError, TransportError};

use crate::*;

#[tokio::test]
async fn test_one_failing_slot_leaves_the_others_open() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::attach(&air, "02:00:00:00:00:00");
    let broken = local.node.registry().slots()[1];
    local.radio.fail_listener(broken.service_id);

    let errors = match local.node.start().await.unwrap_err() {
        NodeError::Listeners(errors) => errors,
        other => panic!("expected listener errors, got {other}"),
    };
    assert_eq!(errors.slots(), vec![1]);
    assert!(errors.to_string().contains("slot 1"));
    assert_eq!(local.node.listening_slots(), vec![0, 2]);

    // Peers can still reach the healthy slots, not the broken one.
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    let miss = a.node.connect_slot(local.address.clone(), 1).await;
    assert!(matches!(
        miss,
        Err(ConnectError::Transport {
            source: TransportError::PeerUnreachable(_),
            ..
        })
    ));
    a.node.connect_slot(local.address.clone(), 2).await?;

    a.shutdown().await?;
    local.shutdown().await
}

#[tokio::test]
async fn test_stop_twice_is_harmless() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, "02:00:00:00:00:00").await?;
    let a = Device::attach(&air, "0A:00:00:00:00:01");
    a.node.connect_slot(local.address.clone(), 0).await?;
    wait_until(|| local.node.sessions().connected_count() == 1).await?;

    local.node.stop().await?;
    local.node.stop().await?;
    assert!(local.node.listening_slots().is_empty());
    assert_eq!(air.link_count(), 0);

    // Restart picks every slot up again.
    local.node.start().await?;
    assert_eq!(local.node.listening_slots(), vec![0, 1, 2]);

    a.shutdown().await?;
    local.shutdown().await
}

#[tokio::test]
async fn test_close_failure_is_reported_and_stop_continues() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::listening(&air, "02:00:00:00:00:00").await?;
    let stuck = local.node.registry().slots()[0];
    local.radio.fail_close(stuck.service_id);

    let errors = match local.node.stop().await.unwrap_err() {
        NodeError::Listeners(errors) => errors,
        other => panic!("expected listener errors, got {other}"),
    };
    assert_eq!(errors.slots(), vec![0]);
    assert!(local.node.listening_slots().is_empty());

    // Nothing left to close the second time.
    local.node.stop().await?;
    local.shutdown().await
}

#[tokio::test]
async fn test_radio_power_cycle() -> Result<()> {
    let air = LoopbackAir::new();
    let local = Device::attach(&air, "02:00:00:00:00:00");
    let radio_flag = local.node.radio_enabled();

    local.radio.set_enabled(false);
    assert!(matches!(local.node.start().await, Err(NodeError::RadioDisabled)));
    wait_until(|| !*radio_flag.borrow()).await?;
    assert!(local.node.listening_slots().is_empty());

    // Turning the radio on makes the node listen without another start.
    local.radio.set_enabled(true);
    wait_until(|| *radio_flag.borrow() && local.node.listening_slots().len() == 3).await?;

    let a = Device::attach(&air, "0A:00:00:00:00:01");
    a.node.connect_slot(local.address.clone(), 1).await?;
    wait_until(|| local.node.sessions().connected_count() == 1).await?;

    // Power off drops the link on both sides.
    local.radio.set_enabled(false);
    wait_until(|| local.node.sessions().connected_count() == 0).await?;
    wait_until(|| a.node.sessions().connected_count() == 0).await?;
    wait_until(|| local.node.listening_slots().is_empty()).await?;
    assert!(matches!(
        a.node.connect_slot(PeerId::new("02:00:00:00:00:00"), 1).await,
        Err(ConnectError::Transport { .. })
    ));

    a.shutdown().await?;
    local.shutdown().await
}
