//! Contract Test: Device Convergence
//!
//! Constraints verified:
//! - A differing config forces a close and an immediate reconnect to the new host
//! - An identical config triggers zero reconnection attempts
//! - A device that was offline applies only the latest retained config
//! - Malformed payloads never disturb the applied state
//! - Operator overrides are applied exactly like detected changes
//! - Failed reconnects back off; slow ones never block longer than the tick
//!   budget and resume on the next tick
//! - Applied state survives a reboot when a store is configured

mod common;

use common::*;
use hostcfg_core::traits::ConfigBroker;
use hostcfg_core::{
    ApplyOutcome, ConfigPublisher, DeviceAgent, DeviceConfigState, FileConfigStore, LinkState,
    MemoryBroker, MemoryConfigStore, PublisherConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn agent_on(link: &CountingServiceLink, default_host: &str) -> DeviceAgent {
    DeviceAgent::new(
        Box::new(CountingServiceLink::sharing_counters_with(link)),
        agent_config(default_host),
    )
    .expect("agent construction succeeds")
}

#[tokio::test]
async fn boots_disconnected_on_defaults() {
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "D");

    assert_eq!(agent.link_state(), LinkState::Disconnected);
    assert_eq!(agent.state().active_host(), "D");

    agent.tick().await;
    assert_eq!(agent.link_state(), LinkState::ConnectedStaleConfig);
    assert_eq!(link.attempted_hosts(), vec!["D"]);
}

#[tokio::test]
async fn address_change_forces_reconnect_to_new_host() {
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "A");
    agent.tick().await;
    assert_eq!(agent.handle_payload(&config_payload("A")).await, ApplyOutcome::Unchanged);
    assert_eq!(agent.link_state(), LinkState::ConnectedCurrentConfig);
    let closes_before = link.close_count();

    let outcome = agent.handle_payload(&config_payload("B")).await;

    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            previous: endpoints("A"),
            current: endpoints("B"),
        }
    );
    assert_eq!(link.close_count(), closes_before + 1, "old link is force-closed");
    assert_eq!(link.attempted_hosts(), vec!["A", "B"]);
    assert_eq!(agent.state().active_host(), "B");
    assert_eq!(agent.state().active.secondary.port, 5001);
    assert_eq!(agent.link_state(), LinkState::ConnectedCurrentConfig);
}

#[tokio::test]
async fn identical_config_triggers_zero_reconnects() {
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "A");
    agent.tick().await;
    let connects = link.connect_count();
    let closes = link.close_count();

    for _ in 0..3 {
        assert_eq!(agent.handle_payload(&config_payload("A")).await, ApplyOutcome::Unchanged);
    }

    assert_eq!(link.connect_count(), connects);
    assert_eq!(link.close_count(), closes);
    assert_eq!(agent.state().last_applied_digest, None);
}

#[tokio::test]
async fn malformed_payload_keeps_prior_state() {
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "A");
    agent.tick().await;
    let before = agent.state().clone();
    let closes = link.close_count();

    for payload in [
        b"".as_slice(),
        b"{ not json".as_slice(),
        br#"{"primary_service_host": "B"}"#.as_slice(),
        concat!(
            r#"{"primary_service_host":"","primary_service_port":1883,"#,
            r#""secondary_service_host":"B","secondary_service_port":5001}"#
        )
        .as_bytes(),
    ] {
        let outcome = agent.handle_payload(payload).await;
        assert!(matches!(outcome, ApplyOutcome::Rejected { .. }), "{:?}", outcome);
    }

    assert_eq!(agent.state(), &before);
    assert_eq!(link.close_count(), closes);
    assert_eq!(agent.link_state(), LinkState::ConnectedStaleConfig);
}

#[tokio::test]
async fn retained_config_applied_on_first_subscribe() {
    // Published before the device booted
    let broker = MemoryBroker::new();
    broker.publish(&topic(), config_payload("E"), true).await.unwrap();

    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "D");
    let feed = broker.subscribe(&topic()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        agent.run_with_shutdown(feed, Some(shutdown_rx)).await.map(|_| agent)
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(()).unwrap();
    let agent = handle.await.unwrap().unwrap();

    assert_eq!(agent.state().active_host(), "E");
    assert_eq!(link.last_attempt(), Some(endpoints("E")));
    assert!(agent.state().last_applied_digest.is_some());
}

#[tokio::test]
async fn offline_device_applies_only_latest_config() {
    let broker = MemoryBroker::new();
    let source = ScriptedAddressSource::new(None);
    let (mut publisher, _events) = ConfigPublisher::new(
        Box::new(ScriptedAddressSource::sharing_counters_with(&source)),
        Arc::new(broker.clone()),
        PublisherConfig::new(topic()).with_ports(PRIMARY_PORT, SECONDARY_PORT),
    )
    .unwrap();

    // Device is offline through several changes
    let addresses = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"];
    for address in addresses {
        source.set(Some(address));
        publisher.tick().await;
    }

    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "D");
    let feed = broker.subscribe(&topic()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        agent.run_with_shutdown(feed, Some(shutdown_rx)).await.map(|_| agent)
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(()).unwrap();
    let agent = handle.await.unwrap().unwrap();

    assert_eq!(agent.state().active_host(), "10.0.0.4");
    for intermediate in &addresses[..3] {
        assert!(
            !link.attempted_hosts().iter().any(|h| h == intermediate),
            "device must never see intermediate address {}",
            intermediate
        );
    }
}

#[tokio::test]
async fn reaches_current_config_after_convergence() {
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "D");

    agent.handle_payload(&config_payload("E")).await;

    assert_eq!(agent.link_state(), LinkState::ConnectedCurrentConfig);
    assert_eq!(link.attempted_hosts(), vec!["E"]);
}

#[tokio::test]
async fn operator_override_is_applied_like_a_detected_change() {
    let broker = MemoryBroker::new();
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "D");
    let feed = broker.subscribe(&topic()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        agent.run_with_shutdown(feed, Some(shutdown_rx)).await.map(|_| agent)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Hand-written by an operator: string ports, padded host
    let manual = br#"{
        "primary_service_host": " 172.16.0.9 ",
        "primary_service_port": "1883",
        "secondary_service_host": "172.16.0.9",
        "secondary_service_port": "5001"
    }"#;
    broker.publish(&topic(), manual.to_vec(), true).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(()).unwrap();
    let agent = handle.await.unwrap().unwrap();

    assert_eq!(agent.state().active, endpoints("172.16.0.9"));
    assert_eq!(link.last_attempt(), Some(endpoints("172.16.0.9")));
}

#[tokio::test]
async fn failed_reconnect_backs_off_then_succeeds() {
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "A");
    agent.tick().await;

    link.fail_next(2);
    agent.handle_payload(&config_payload("B")).await;
    assert_eq!(agent.link_state(), LinkState::Disconnected);
    assert_eq!(link.connect_count(), 2);

    // Inside the first backoff window (40ms): no attempt
    agent.tick().await;
    assert_eq!(link.connect_count(), 2);

    tokio::time::sleep(Duration::from_millis(60)).await;
    agent.tick().await;
    assert_eq!(link.connect_count(), 3);
    assert_eq!(agent.link_state(), LinkState::Disconnected);

    // Second backoff window is 80ms
    tokio::time::sleep(Duration::from_millis(40)).await;
    agent.tick().await;
    assert_eq!(link.connect_count(), 3);

    tokio::time::sleep(Duration::from_millis(60)).await;
    agent.tick().await;
    assert_eq!(link.connect_count(), 4);
    assert_eq!(agent.link_state(), LinkState::ConnectedCurrentConfig);
    assert_eq!(agent.state().active_host(), "B");
}

#[tokio::test]
async fn slow_connect_never_blocks_a_tick() {
    let link = CountingServiceLink::new();
    link.set_connect_delay(Duration::from_secs(5));
    let mut agent = agent_on(&link, "A");

    for _ in 0..2 {
        let started = Instant::now();
        agent.tick().await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "a tick blocked for {:?}",
            started.elapsed()
        );
    }

    assert_eq!(agent.link_state(), LinkState::Disconnected);
    assert!(agent.is_connecting());
    assert_eq!(link.connect_count(), 1, "the running attempt is resumed, not restarted");
}

#[tokio::test]
async fn handshake_longer_than_tick_budget_still_converges() {
    // 300ms handshake against a 200ms tick budget
    let link = CountingServiceLink::new();
    link.set_connect_delay(Duration::from_millis(300));
    let mut agent = agent_on(&link, "A");

    for _ in 0..40 {
        agent.tick().await;
        if agent.link_state() != LinkState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(agent.link_state(), LinkState::ConnectedStaleConfig);
    assert_eq!(link.connect_count(), 1);
    assert_eq!(agent.connect_attempts(), 1);
    assert!(!agent.is_connecting());
}

#[tokio::test]
async fn config_change_abandons_in_flight_connect() {
    let link = CountingServiceLink::new();
    link.set_connect_delay(Duration::from_millis(300));
    let mut agent = agent_on(&link, "A");
    agent.tick().await;
    assert!(agent.is_connecting());

    let outcome = agent.handle_payload(&config_payload("B")).await;
    assert!(matches!(outcome, ApplyOutcome::Applied { .. }));

    for _ in 0..40 {
        if agent.link_state() != LinkState::Disconnected {
            break;
        }
        agent.tick().await;
    }

    assert_eq!(link.attempted_hosts(), vec!["A", "B"]);
    assert_eq!(link.last_attempt(), Some(endpoints("B")));
    assert_eq!(agent.link_state(), LinkState::ConnectedCurrentConfig);
}

#[tokio::test]
async fn dropped_link_is_reconnected_on_next_tick() {
    let link = CountingServiceLink::new();
    let mut agent = agent_on(&link, "A");
    agent.tick().await;
    assert_eq!(link.connect_count(), 1);

    link.drop_link();
    agent.tick().await;

    assert_eq!(link.connect_count(), 2);
    assert_eq!(link.attempted_hosts(), vec!["A", "A"]);
    assert_eq!(agent.link_state(), LinkState::ConnectedStaleConfig);
}

#[tokio::test]
async fn applied_config_survives_reboot_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.json");

    {
        let link = CountingServiceLink::new();
        let store = FileConfigStore::new(&path).await.unwrap();
        let mut agent = DeviceAgent::with_store(Box::new(link), Box::new(store), agent_config("D"))
            .await
            .unwrap();
        agent.handle_payload(&config_payload("E")).await;
    }

    let link = CountingServiceLink::new();
    let store = FileConfigStore::new(&path).await.unwrap();
    let mut agent = DeviceAgent::with_store(
        Box::new(CountingServiceLink::sharing_counters_with(&link)),
        Box::new(store),
        agent_config("D"),
    )
    .await
    .unwrap();

    assert_eq!(agent.state().active_host(), "E");
    agent.tick().await;
    assert_eq!(link.attempted_hosts(), vec!["E"]);
}

#[tokio::test]
async fn memory_store_sees_every_applied_config() {
    let store = MemoryConfigStore::new();
    let link = CountingServiceLink::new();
    let mut agent = DeviceAgent::with_store(
        Box::new(link),
        Box::new(store.clone()),
        agent_config("D"),
    )
    .await
    .unwrap();

    agent.handle_payload(&config_payload("E")).await;
    agent.handle_payload(&config_payload("E")).await;

    let saved: DeviceConfigState = store.snapshot().await.unwrap();
    assert_eq!(saved.active, endpoints("E"));
    assert_eq!(saved, *agent.state());
}
