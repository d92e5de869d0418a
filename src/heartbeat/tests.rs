use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{advance, timeout};

use super::manager::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager};
use crate::message::MessageType;

fn config(interval_ms: u64, timeout_ms: u64, max_missed: u32) -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_millis(interval_ms),
        timeout: Duration::from_millis(timeout_ms),
        max_missed,
    }
}

async fn next(rx: &mut UnboundedReceiver<HeartbeatEvent>) -> HeartbeatEvent {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no heartbeat event")
        .expect("channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_start_probes_immediately() {
    let (manager, mut rx) = HeartbeatManager::new(config(1000, 300, 3));
    manager.start();
    assert!(manager.is_running());

    match next(&mut rx).await {
        HeartbeatEvent::Probe(msg) => assert_eq!(msg.kind, MessageType::Heartbeat),
        other => panic!("expected probe, got {other:?}"),
    }
    assert_eq!(manager.stats().probes_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pong_measures_latency_and_resets_missed() {
    let (manager, mut rx) = HeartbeatManager::new(config(1000, 300, 3));
    manager.start();
    assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));

    // first probe goes unanswered
    assert_eq!(next(&mut rx).await, HeartbeatEvent::Timeout { missed: 1 });
    assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));

    advance(Duration::from_millis(40)).await;
    let latency = manager.handle_pong().expect("probe outstanding");
    assert_eq!(latency, Duration::from_millis(40));
    assert_eq!(next(&mut rx).await, HeartbeatEvent::Pong { latency });

    let stats = manager.stats();
    assert_eq!(stats.missed_beats, 0);
    assert_eq!(stats.pongs_received, 1);
    assert_eq!(stats.last_latency, Some(latency));
    assert_eq!(stats.average_latency, Some(latency));
}

#[tokio::test(start_paused = true)]
async fn test_pong_without_probe_is_ignored() {
    let (manager, _rx) = HeartbeatManager::new(config(1000, 300, 3));
    assert!(manager.handle_pong().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_connection_lost_after_max_missed() {
    let (manager, mut rx) = HeartbeatManager::new(config(1000, 300, 3));
    manager.start();

    for missed in 1..=3 {
        assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));
        assert_eq!(next(&mut rx).await, HeartbeatEvent::Timeout { missed });
    }
    assert_eq!(next(&mut rx).await, HeartbeatEvent::ConnectionLost);
    assert!(!manager.is_running());

    // nothing else fires once the manager stopped itself
    let quiet = timeout(Duration::from_secs(30), rx.recv()).await;
    assert!(quiet.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_longer_than_interval_still_detects_silence() {
    let (manager, mut rx) = HeartbeatManager::new(config(1000, 3000, 3));
    manager.start();

    // each probe is superseded before its own deadline; the next probe
    // counts it as missed instead
    for missed in 1..=3 {
        assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));
        assert_eq!(next(&mut rx).await, HeartbeatEvent::Timeout { missed });
    }
    assert_eq!(next(&mut rx).await, HeartbeatEvent::ConnectionLost);
    assert!(!manager.is_running());
    assert_eq!(manager.stats().probes_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_cancels_deadline() {
    let (manager, mut rx) = HeartbeatManager::new(config(1000, 300, 1));
    manager.start();
    assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));

    manager.stop();
    manager.stop();
    assert!(!manager.is_running());

    let quiet = timeout(Duration::from_secs(5), rx.recv()).await;
    assert!(quiet.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_restart_ignores_stale_deadline() {
    let (manager, mut rx) = HeartbeatManager::new(config(1000, 300, 1));
    manager.start();
    assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));

    advance(Duration::from_millis(200)).await;
    manager.stop();
    manager.start();
    assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));

    // answered before the new deadline, so the old one must not count
    advance(Duration::from_millis(200)).await;
    assert!(manager.handle_pong().is_some());
    assert!(matches!(next(&mut rx).await, HeartbeatEvent::Pong { .. }));
    assert!(manager.is_running());
    assert_eq!(manager.stats().missed_beats, 0);
}

#[tokio::test(start_paused = true)]
async fn test_latency_history_is_bounded() {
    let (manager, mut rx) = HeartbeatManager::new(config(100, 50, 3));
    manager.start();
    for _ in 0..15 {
        assert!(matches!(next(&mut rx).await, HeartbeatEvent::Probe(_)));
        advance(Duration::from_millis(10)).await;
        manager.handle_pong();
        assert!(matches!(next(&mut rx).await, HeartbeatEvent::Pong { .. }));
    }
    let stats = manager.stats();
    assert_eq!(stats.latency_samples, 10);
    assert_eq!(stats.pongs_received, 15);
}

#[test]
fn test_envelope_predicates() {
    let probe = HeartbeatManager::create_heartbeat();
    let pong = HeartbeatManager::create_heartbeat_ack();
    assert!(HeartbeatManager::is_heartbeat(&probe));
    assert!(!HeartbeatManager::is_heartbeat_ack(&probe));
    assert!(HeartbeatManager::is_heartbeat_ack(&pong));
    assert!(probe.payload.get("timestamp").is_some());
}
