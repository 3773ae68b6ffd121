//! End-to-end connection lifecycle tests over the in-memory transport

use gridrelay_client::{ClientConfig, ConnectionKey, Dispatcher, StatusAggregator, Supervisor};
use gridrelay_transport::memory::{MemoryConnector, MemoryPeer};
use gridrelay_transport::{LinkState, OutboundFrame};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const ENDPOINT_A: &str = "wss://a.example:4650";
const ENDPOINT_B: &str = "wss://b.example:4444";

struct Harness {
    supervisor: Supervisor,
    connector: Arc<MemoryConnector>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    status: StatusAggregator,
}

fn harness(identities: &[&str]) -> Harness {
    let config = ClientConfig::builder()
        .identities(identities.iter().copied())
        .endpoints([ENDPOINT_A, ENDPOINT_B])
        .build()
        .unwrap();

    let (connector, peers) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let status = StatusAggregator::new(identities.len());
    let supervisor = Supervisor::new(
        &config,
        connector.clone(),
        Arc::new(Dispatcher::from_config(&config)),
        status.clone(),
    );

    Harness {
        supervisor,
        connector,
        peers,
        status,
    }
}

fn address() -> IpAddr {
    "10.0.0.1".parse().unwrap()
}

fn key(identity: &str) -> ConnectionKey {
    ConnectionKey::new(identity, address())
}

/// Next non-ping text frame written by the node, parsed as JSON
async fn next_reply(peer: &mut MemoryPeer) -> Option<Value> {
    while let Some(frame) = peer.recv().await {
        if let OutboundFrame::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["action"] != "PING" {
                return Some(value);
            }
        }
    }
    None
}

/// Drain frames until the node closes the link; returns the pings seen
async fn pings_until_close(peer: &mut MemoryPeer) -> usize {
    let mut pings = 0;
    while let Some(frame) = peer.recv().await {
        match frame {
            OutboundFrame::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["action"] == "PING" {
                    pings += 1;
                }
            }
            OutboundFrame::Close => break,
        }
    }
    pings
}

#[tokio::test(start_paused = true)]
async fn test_auth_round_trip_marks_identity_online() {
    let mut h = harness(&["u1"]);
    h.supervisor.start(key("u1"));

    let mut peer = h.peers.recv().await.unwrap();
    assert_eq!(peer.endpoint, ENDPOINT_A);
    assert_eq!(peer.local_addr, address());
    assert!(!h.status.is_online("u1"));

    assert!(peer.send_text(r#"{"id":"abc","action":"AUTH","data":{}}"#).await);
    let reply = next_reply(&mut peer).await.unwrap();

    assert_eq!(reply["id"], "abc");
    assert_eq!(reply["origin_action"], "AUTH");
    assert_eq!(reply["result"]["user_id"], "u1");
    assert!(reply["result"]["browser_id"].is_string());
    assert!(h.status.is_online("u1"));

    let snapshot = h.status.snapshot();
    assert_eq!((snapshot.total, snapshot.online, snapshot.remaining), (1, 1, 0));

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_browser_id_survives_restart() {
    let mut h = harness(&["u1"]);
    h.supervisor.start(key("u1"));

    let mut first = h.peers.recv().await.unwrap();
    first.send_text(r#"{"id":"1","action":"AUTH"}"#).await;
    let before = next_reply(&mut first).await.unwrap();

    let generation = h.supervisor.generation_of(&key("u1")).unwrap();
    h.supervisor.restart(&key("u1"), generation).await;

    let mut second = h.peers.recv().await.unwrap();
    second.send_text(r#"{"id":"2","action":"AUTH"}"#).await;
    let after = next_reply(&mut second).await.unwrap();

    assert_eq!(before["result"]["browser_id"], after["result"]["browser_id"]);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_is_dropped() {
    let mut h = harness(&["u1"]);
    h.supervisor.start(key("u1"));
    let mut peer = h.peers.recv().await.unwrap();

    assert!(peer.send_text("{not json").await);
    assert!(peer.send_text(r#"{"action":"AUTH"}"#).await);
    assert!(peer.send_text(r#"{"id":"ok","action":"AUTH"}"#).await);

    let reply = next_reply(&mut peer).await.unwrap();
    assert_eq!(reply["id"], "ok");
    assert_eq!(h.supervisor.state_of(&key("u1")), Some(LinkState::Open));

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_action_gets_no_reply() {
    let mut h = harness(&["u1"]);
    h.supervisor.start(key("u1"));
    let mut peer = h.peers.recv().await.unwrap();

    peer.send_text(r#"{"id":"x","action":"REBOOT"}"#).await;
    peer.send_text(r#"{"id":"y","action":"PONG"}"#).await;
    peer.send_text(r#"{"id":"z","action":"AUTH"}"#).await;

    let reply = next_reply(&mut peer).await.unwrap();
    assert_eq!(reply["id"], "z");

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_is_replaced() {
    let mut h = harness(&["u1"]);
    let started = Instant::now();
    h.supervisor.start(key("u1"));

    let mut first = h.peers.recv().await.unwrap();
    let generation = h.supervisor.generation_of(&key("u1")).unwrap();

    let second = h.peers.recv().await.unwrap();
    let elapsed = started.elapsed();

    // 29s threshold, checked every 20s
    assert!(elapsed > Duration::from_secs(29));
    assert!(elapsed <= Duration::from_secs(49));
    assert_eq!(second.local_addr, address());

    // One ping at 20s, then the old link is closed
    assert_eq!(pings_until_close(&mut first).await, 1);

    let current = h.supervisor.generation_of(&key("u1")).unwrap();
    assert!(current > generation);
    assert_eq!(h.supervisor.connection_count(), 1);
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.supervisor.retries(), 0);

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_live_traffic_keeps_connection() {
    let mut h = harness(&["u1"]);
    h.supervisor.start(key("u1"));
    let peer = h.peers.recv().await.unwrap();
    let generation = h.supervisor.generation_of(&key("u1")).unwrap();

    for _ in 0..12 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(peer.send_text(r#"{"id":"p","action":"PONG"}"#).await);
    }

    assert_eq!(h.supervisor.generation_of(&key("u1")), Some(generation));
    assert_eq!(h.connector.attempts(), 1);
    assert!(h.peers.try_recv().is_err());

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_handshake_rotates_endpoint() {
    let mut h = harness(&["u1"]);
    h.connector.fail_next(1);

    let started = Instant::now();
    h.supervisor.start(key("u1"));

    let peer = h.peers.recv().await.unwrap();
    assert_eq!(peer.endpoint, ENDPOINT_B);
    assert_eq!(started.elapsed(), Duration::from_secs(20));
    assert_eq!(h.supervisor.retries(), 1);
    assert_eq!(h.connector.attempts(), 2);

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_counts_as_retry() {
    let mut h = harness(&["u1"]);
    h.supervisor.start(key("u1"));

    let peer = h.peers.recv().await.unwrap();
    assert!(peer.send_error("connection reset").await);

    let next = h.peers.recv().await.unwrap();
    assert_eq!(next.endpoint, ENDPOINT_B);
    assert_eq!(h.supervisor.retries(), 1);

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_marks_offline_then_reconnects() {
    let mut h = harness(&["u1"]);
    h.supervisor.start(key("u1"));

    let mut peer = h.peers.recv().await.unwrap();
    peer.send_text(r#"{"id":"a","action":"AUTH"}"#).await;
    next_reply(&mut peer).await.unwrap();
    assert!(h.status.is_online("u1"));

    assert!(peer.close(1000, "bye").await);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(!h.status.is_online("u1"));
    assert_eq!(h.supervisor.state_of(&key("u1")), Some(LinkState::Closed));

    // A clean close does not count as an error, so the endpoint stays put
    let next = h.peers.recv().await.unwrap();
    assert_eq!(next.endpoint, ENDPOINT_A);
    assert_eq!(h.supervisor.retries(), 0);

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_all_staggers_starts() {
    let mut h = harness(&["u1", "u2", "u3"]);
    let plan = vec![key("u1"), key("u2"), key("u3")];

    let started = Instant::now();
    let supervisor = h.supervisor.clone();
    tokio::spawn(async move {
        supervisor
            .start_all(plan, Duration::from_secs(3))
            .await
    });

    let mut offsets = Vec::new();
    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(h.peers.recv().await.unwrap());
        offsets.push(started.elapsed().as_secs());
    }

    assert_eq!(offsets, vec![0, 3, 6]);
    assert_eq!(h.supervisor.connection_count(), 3);

    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_every_connection() {
    let mut h = harness(&["u1", "u2"]);
    h.supervisor.start(key("u1"));
    h.supervisor.start(key("u2"));

    let mut first = h.peers.recv().await.unwrap();
    let mut second = h.peers.recv().await.unwrap();
    first.send_text(r#"{"id":"a","action":"AUTH"}"#).await;
    next_reply(&mut first).await.unwrap();
    assert_eq!(h.status.snapshot().online, 1);

    h.supervisor.shutdown().await;

    assert_eq!(pings_until_close(&mut first).await, 0);
    assert_eq!(pings_until_close(&mut second).await, 0);
    assert_eq!(h.supervisor.connection_count(), 0);
    assert_eq!(h.status.snapshot().online, 0);

    // No restarts after shutdown
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.peers.try_recv().is_err());
}
