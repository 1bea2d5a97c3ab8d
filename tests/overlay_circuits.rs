//! Integration tests for multi-hop circuits over loopback.
//!
//! Every node is a real `OverlayHandle` with its own UDP socket, so these
//! tests cover framing, gossip, hop-by-hop extension, relaying, the exit
//! sockets and teardown end to end.

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use swarmgate::circuit::OverlayConfig;
use swarmgate::messages::CircuitState;
use swarmgate::{Endpoint, EventBus, Identity, OverlayHandle, Topic};
use tokio::net::UdpSocket;
use tokio::time::timeout;

static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config(exit: bool, length: usize, target: usize, bootstrap: Vec<SocketAddr>) -> OverlayConfig {
    OverlayConfig {
        circuit_length: length,
        target_circuits: target,
        exit_capable: exit,
        bootstrap,
        gossip_interval: Duration::from_millis(100),
        tick_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

async fn relay(seed: u8, exit: bool) -> OverlayHandle {
    let (node, _returns) = OverlayHandle::bind(
        config(exit, 1, 0, vec![]),
        Identity::from_bytes([seed; 32]),
        "127.0.0.1:0".parse().unwrap(),
        EventBus::default(),
    )
    .await
    .expect("relay bind failed");
    node
}

async fn echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Wait until `node` holds no relay rules, up to the test timeout.
async fn relay_rules_drained(node: &OverlayHandle) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if node.stats().await.is_ok_and(|s| s.relay_rules == 0) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn three_hop_circuit_round_trip_and_teardown() {
    init_tracing();
    let middle_a = relay(10, false).await;
    let middle_b = relay(11, false).await;
    let exit = relay(12, true).await;

    let events = EventBus::default();
    let (client, mut returns) = OverlayHandle::bind(
        config(
            false,
            3,
            1,
            vec![middle_a.local_addr(), middle_b.local_addr(), exit.local_addr()],
        ),
        Identity::from_bytes([13; 32]),
        "127.0.0.1:0".parse().unwrap(),
        events.clone(),
    )
    .await
    .unwrap();

    timeout(TEST_TIMEOUT, client.wait_ready(1))
        .await
        .expect("circuit not ready in time")
        .unwrap();

    let circuits = client.list_circuits().await.unwrap();
    let ready: Vec<_> = circuits.iter().filter(|c| c.state == CircuitState::Ready).collect();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].hops.len(), 3);
    assert_eq!(ready[0].hops[2], exit.local_addr(), "only exit-capable peer must be last");

    let echo = echo_server().await;
    let payload = b"three hops out and back".to_vec();
    client
        .tunnel(Endpoint::Ip(echo), payload.clone())
        .await
        .unwrap();
    let back = timeout(TEST_TIMEOUT, returns.recv())
        .await
        .expect("no echo in time")
        .expect("return channel closed");
    assert_eq!(back.origin, Endpoint::Ip(echo));
    assert_eq!(back.payload, payload);

    let exit_stats = exit.stats().await.unwrap();
    assert_eq!(exit_stats.bytes_exit, payload.len() as u64);
    for middle in [&middle_a, &middle_b] {
        let stats = middle.stats().await.unwrap();
        assert!(stats.relay_rules > 0);
        assert!(stats.bytes_relayed > 0);
        assert_eq!(stats.bytes_exit, 0);
    }
    let client_stats = client.stats().await.unwrap();
    assert_eq!(client_stats.bytes_enter, payload.len() as u64);
    assert!(events.drain().iter().any(|e| e.topic == Topic::CircuitReady));

    client.stop().await.unwrap();
    assert!(!client.is_online());
    for middle in [&middle_a, &middle_b] {
        assert!(relay_rules_drained(middle).await, "relay rules left behind after teardown");
    }

    client.quit().await;
    for node in [middle_a, middle_b, exit] {
        node.quit().await;
    }
}

#[tokio::test]
async fn data_stays_in_order_within_a_circuit() {
    init_tracing();
    let middle = relay(20, false).await;
    let exit = relay(21, true).await;
    let (client, mut returns) = OverlayHandle::bind(
        config(false, 2, 1, vec![middle.local_addr(), exit.local_addr()]),
        Identity::from_bytes([22; 32]),
        "127.0.0.1:0".parse().unwrap(),
        EventBus::default(),
    )
    .await
    .unwrap();
    timeout(TEST_TIMEOUT, client.wait_ready(1))
        .await
        .expect("circuit not ready in time")
        .unwrap();

    let echo = echo_server().await;
    for i in 0u8..20 {
        client.tunnel(Endpoint::Ip(echo), vec![i]).await.unwrap();
    }
    let mut last = None;
    for _ in 0..20 {
        let Ok(Some(back)) = timeout(Duration::from_secs(2), returns.recv()).await else {
            break;
        };
        let value = back.payload[0];
        assert!(last.is_none_or(|prev| value > prev), "datagrams reordered");
        last = Some(value);
    }
    assert!(last.is_some(), "nothing came back");

    client.quit().await;
    middle.quit().await;
    exit.quit().await;
}

#[tokio::test]
async fn without_an_exit_no_circuit_is_built() {
    init_tracing();
    let a = relay(30, false).await;
    let b = relay(31, false).await;
    let (client, _returns) = OverlayHandle::bind(
        config(false, 2, 1, vec![a.local_addr(), b.local_addr()]),
        Identity::from_bytes([32; 32]),
        "127.0.0.1:0".parse().unwrap(),
        EventBus::default(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.ready_count(), 0);
    assert!(client.list_circuits().await.unwrap().is_empty());
    let stats = client.stats().await.unwrap();
    assert!(stats.known_peers >= 2);

    client.quit().await;
    a.quit().await;
    b.quit().await;
}
