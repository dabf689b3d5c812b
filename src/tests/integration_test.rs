//! Multi-node scenarios, all nodes in one process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use crate::affinity::{AffinityTable, AffinityToken, Resolution};
use crate::backplane::hub::{DEFAULT_PEER_QUEUE_LIMIT, Hub};
use crate::backplane::{Backoff, HubClient, MemoryBackplane, MemoryBus};
use crate::broker::codec::Delivery;
use crate::client::{CloseReason, Connection, OutboundQueue, OverflowPolicy};
use crate::config::Settings;
use crate::node::Node;
use crate::presence::HealthState;
use crate::transport::message::ServerMessage;

const DELIVERY_BOUND: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestClient {
    id: String,
    ws: Socket,
}

impl TestClient {
    async fn join(node: &Node) -> Self {
        let (mut ws, _) = connect_async(node.url()).await.expect("client connect");
        let id = match next_frame(&mut ws).await {
            Some(ServerMessage::Welcome { connection_id, .. }) => connection_id,
            other => panic!("expected welcome, got {other:?}"),
        };
        Self { id, ws }
    }

    async fn send(&mut self, frame: serde_json::Value) {
        self.ws
            .send(WsMessage::text(frame.to_string()))
            .await
            .expect("client send");
    }

    async fn publish(&mut self, topic: &str, payload: &str) {
        self.send(json!({"type": "publish", "topic": topic, "payload": payload}))
            .await;
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        match next_frame(&mut self.ws).await {
            Some(ServerMessage::Message(delivery)) => Some(delivery),
            _ => None,
        }
    }

    /// Whatever arrives within `window`.
    async fn collect_for(&mut self, window: Duration) -> Vec<Delivery> {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(left, self.ws.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    if let Ok(ServerMessage::Message(d)) = ServerMessage::parse(text.as_str()) {
                        out.push(d);
                    }
                }
                Ok(Some(Ok(_))) => {}
                _ => break,
            }
        }
        out
    }
}

async fn next_frame(ws: &mut Socket) -> Option<ServerMessage> {
    loop {
        match tokio::time::timeout(DELIVERY_BOUND, ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                return ServerMessage::parse(text.as_str()).ok();
            }
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => {
                return None;
            }
            Ok(Some(Ok(_))) => {}
        }
    }
}

fn settings(id: &str) -> Settings {
    let mut settings = Settings::default();
    settings.node.id = id.to_string();
    settings.node.listen_port = 0;
    settings.node.drain_timeout_ms = 500;
    settings.presence.interval_ms = 50;
    settings.presence.liveness_timeout_ms = 300;
    settings
}

async fn memory_node(bus: &MemoryBus, id: &str) -> (Node, MemoryBackplane) {
    let link = bus.attach();
    let node = Node::start(settings(id), Arc::new(link.clone()))
        .await
        .expect("node start");
    (node, link)
}

async fn hub_node(hub_url: &str, id: &str) -> Node {
    let client = HubClient::connect(
        hub_url.to_string(),
        Backoff::from_millis(10, 100),
        Duration::from_secs(2),
    )
    .await
    .expect("hub connect");
    Node::start(settings(id), Arc::new(client))
        .await
        .expect("node start")
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let reached = tokio::time::timeout(DELIVERY_BOUND, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn subscribe(client: &mut TestClient, node: &Node, topic: &str) {
    client.send(json!({"type": "subscribe", "topic": topic})).await;
    let registry = node.context().registry.clone();
    let id = client.id.clone();
    eventually("subscription", || {
        registry.get(&id).is_some_and(|c| c.is_subscribed(topic))
    })
    .await;
}

#[tokio::test]
async fn hi_from_a_reaches_b_over_the_hub_but_not_the_sender() {
    let hub = Hub::spawn("127.0.0.1:0", DEFAULT_PEER_QUEUE_LIMIT)
        .await
        .unwrap();
    let a = hub_node(&hub.url(), "A").await;
    let b = hub_node(&hub.url(), "B").await;
    eventually("both nodes on the hub", || {
        hub.hub().subscriber_count("broadcast") == 2
    })
    .await;

    let mut x = TestClient::join(&a).await;
    let mut y = TestClient::join(&b).await;
    subscribe(&mut x, &a, "t").await;
    subscribe(&mut y, &b, "t").await;

    x.publish("t", "hi").await;

    let got = y.next_delivery().await.expect("Y did not receive the message");
    assert_eq!(got.origin_node, "A");
    assert_eq!(got.origin_connection.as_deref(), Some(x.id.as_str()));
    assert_eq!(got.topic, "t");
    assert_eq!(got.payload, "hi");
    assert!(x.collect_for(Duration::from_millis(200)).await.is_empty());

    a.shutdown().await;
    b.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber_on_every_node() {
    let bus = MemoryBus::new();
    let mut nodes = Vec::new();
    for id in ["A", "B", "C"] {
        nodes.push(memory_node(&bus, id).await.0);
    }

    let mut clients = Vec::new();
    for node in &nodes {
        clients.push(TestClient::join(node).await);
        clients.push(TestClient::join(node).await);
    }

    let (publisher, others) = clients.split_at_mut(1);
    publisher[0].send(json!({"type": "publish", "payload": "all"})).await;

    for client in others.iter_mut() {
        let got = client.next_delivery().await.expect("subscriber missed fan-out");
        assert_eq!(got.payload, "all");
        assert_eq!(got.topic, "broadcast");
        assert_eq!(got.origin_node, "A");
    }

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn peers_observe_each_origin_in_publish_order() {
    let hub = Hub::spawn("127.0.0.1:0", DEFAULT_PEER_QUEUE_LIMIT)
        .await
        .unwrap();
    let a = hub_node(&hub.url(), "A").await;
    let b = hub_node(&hub.url(), "B").await;
    eventually("both nodes on the hub", || {
        hub.hub().subscriber_count("broadcast") == 2
    })
    .await;

    let mut y = TestClient::join(&b).await;
    for i in 0..100 {
        a.context()
            .coordinator
            .publish_from_node("broadcast", Bytes::from(format!("{i}")))
            .await
            .unwrap();
    }

    let mut last = 0;
    for i in 0..100 {
        let got = y.next_delivery().await.expect("missing delivery");
        assert_eq!(got.payload, format!("{i}"));
        assert!(got.sequence > last);
        last = got.sequence;
    }

    a.shutdown().await;
    b.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn partitioned_node_keeps_local_broadcast_without_duplicates_after_heal() {
    let bus = MemoryBus::new();
    let (a, link_a) = memory_node(&bus, "A").await;
    let (b, _) = memory_node(&bus, "B").await;

    let mut x = TestClient::join(&a).await;
    let mut x2 = TestClient::join(&a).await;
    let mut y = TestClient::join(&b).await;

    link_a.set_connected(false);
    x.publish("broadcast", "during").await;

    let local = x2.next_delivery().await.expect("local delivery lost");
    assert_eq!(local.payload, "during");
    assert!(y.collect_for(Duration::from_millis(200)).await.is_empty());

    link_a.set_connected(true);
    x.publish("broadcast", "after").await;

    assert_eq!(x2.next_delivery().await.unwrap().payload, "after");
    let remote = y.collect_for(Duration::from_millis(300)).await;
    let payloads: Vec<&str> = remote.iter().map(|d| d.payload.as_str()).collect();
    assert_eq!(payloads, vec!["after"]);
    assert!(x2.collect_for(Duration::from_millis(100)).await.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

const HEALTHY_DELIVERY_BOUND: Duration = Duration::from_millis(50);

#[tokio::test]
async fn slow_consumer_is_cut_off_without_delaying_others() {
    let bus = MemoryBus::new();
    let mut node_settings = settings("A");
    node_settings.delivery.outbound_queue_limit = 64;
    let a = Node::start(node_settings, Arc::new(bus.attach()))
        .await
        .unwrap();
    let ctx = a.context().clone();

    let mut fast = TestClient::join(&a).await;
    // Never drained, as if its socket had stalled.
    let slow = ctx.registry.register(Connection::new(
        "A",
        OutboundQueue::new(8, OverflowPolicy::Disconnect),
    ));

    // Each message is timed from publish to arrival at the healthy client,
    // across the point where the slow connection overflows.
    let mut worst = Duration::ZERO;
    for i in 0..20 {
        let sent = Instant::now();
        ctx.coordinator
            .publish_from_node("broadcast", Bytes::from(format!("{i}")))
            .await
            .unwrap();
        let got = fast.next_delivery().await.expect("fast client starved");
        assert_eq!(got.payload, format!("{i}"));
        worst = worst.max(sent.elapsed());
    }
    assert!(
        worst < HEALTHY_DELIVERY_BOUND,
        "healthy client waited {worst:?} for a delivery"
    );

    assert_eq!(slow.outbound().close_reason(), Some(CloseReason::Overflow));
    assert!(!ctx.registry.contains(&slow.id));
    assert_eq!(ctx.coordinator.stats().overflow_disconnects, 1);

    a.shutdown().await;
}

#[tokio::test]
async fn draining_then_silent_node_loses_affinity() {
    let bus = MemoryBus::new();
    let (a, _) = memory_node(&bus, "A").await;
    let (b, _) = memory_node(&bus, "B").await;
    let tracker = b.context().tracker.clone();

    eventually("A healthy in B's view", || {
        tracker.health("A") == HealthState::Healthy
    })
    .await;

    let table = AffinityTable::new(Duration::from_secs(60));
    let token = AffinityToken::new("client-1");
    table.bind(token.clone(), "A");
    assert_eq!(table.resolve(&token, &tracker), Resolution::Sticky("A".into()));

    a.shutdown().await;
    eventually("A draining in B's view", || {
        tracker.health("A") == HealthState::Draining
    })
    .await;
    assert_eq!(table.resolve(&token, &tracker), Resolution::Sticky("A".into()));
    assert_eq!(table.select_node(&tracker), Some("B".to_string()));

    eventually("A unreachable in B's view", || {
        tracker.health("A") == HealthState::Unreachable
    })
    .await;
    assert_eq!(table.resolve(&token, &tracker), Resolution::Reselect);
    let (_, node) = table.route(Some(&token), &tracker).unwrap();
    assert_eq!(node, "B");

    b.shutdown().await;
}
