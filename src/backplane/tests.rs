use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::frame::HubFrame;
use super::hub::DEFAULT_PEER_QUEUE_LIMIT;
use super::medium::SUBSCRIPTION_BUFFER;
use super::*;
use crate::broker::message::Envelope;
use crate::utils::{Error, StartupError};

async fn recv(sub: &mut Subscription) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .ok()
        .flatten()
}

async fn wait_connected(client: &HubClient) {
    let mut state = client.connection_state();
    tokio::time::timeout(Duration::from_secs(3), state.wait_for(|up| *up))
        .await
        .expect("hub client never connected")
        .expect("hub client stopped");
}

fn fast_backoff() -> Backoff {
    Backoff::from_millis(10, 50)
}

#[test]
fn backoff_doubles_up_to_ceiling() {
    let mut backoff = Backoff::from_millis(100, 1_000);
    let delays: Vec<u64> = (0..6)
        .map(|_| backoff.next_delay().as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
}

#[test]
fn backoff_never_overflows() {
    let mut backoff = Backoff::from_millis(1, 10_000);
    for _ in 0..100 {
        assert!(backoff.next_delay() <= Duration::from_millis(10_000));
    }
    assert_eq!(backoff.attempts(), 100);
}

#[test]
fn hub_frames_are_type_tagged() {
    let frame = HubFrame::Publish {
        channel: "broadcast".into(),
        data: "{}".into(),
    };
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"type": "publish", "channel": "broadcast", "data": "{}"})
    );
    assert_eq!(
        HubFrame::parse(r#"{"type":"subscribe","channel":"presence"}"#).unwrap(),
        HubFrame::Subscribe {
            channel: "presence".into()
        }
    );
}

#[tokio::test]
async fn memory_bus_delivers_to_every_subscriber_including_publisher() {
    let bus = MemoryBus::new();
    let a = bus.attach();
    let b = bus.attach();
    let mut sub_a = a.subscribe("ch").await.unwrap();
    let mut sub_b = b.subscribe("ch").await.unwrap();

    a.publish("ch", "one".into()).await.unwrap();
    a.publish("other", "ignored".into()).await.unwrap();

    assert_eq!(recv(&mut sub_a).await.as_deref(), Some("one"));
    assert_eq!(recv(&mut sub_b).await.as_deref(), Some("one"));
    assert!(sub_b.try_recv().is_none());
    assert_eq!(bus.subscriber_count("ch"), 2);
}

#[tokio::test]
async fn memory_partition_blocks_both_directions() {
    let bus = MemoryBus::new();
    let a = bus.attach();
    let b = bus.attach();
    let mut sub_b = b.subscribe("ch").await.unwrap();

    b.set_connected(false);
    assert!(!b.is_connected());
    assert!(matches!(
        b.publish("ch", "x".into()).await,
        Err(Error::BackplaneUnavailable)
    ));
    a.publish("ch", "missed".into()).await.unwrap();

    b.set_connected(true);
    a.publish("ch", "after".into()).await.unwrap();
    assert_eq!(recv(&mut sub_b).await.as_deref(), Some("after"));
    assert!(sub_b.try_recv().is_none());
}

#[tokio::test]
async fn memory_unsubscribe_and_close_end_delivery() {
    let bus = MemoryBus::new();
    let a = bus.attach();
    let mut sub = a.subscribe("ch").await.unwrap();
    a.unsubscribe("ch").await.unwrap();
    assert!(recv(&mut sub).await.is_none());

    let mut sub = a.subscribe("ch").await.unwrap();
    a.close().await;
    assert!(recv(&mut sub).await.is_none());
    assert_eq!(bus.subscriber_count("ch"), 0);
}

#[tokio::test]
async fn memory_full_subscriber_misses_newest_frames_without_blocking() {
    let bus = MemoryBus::new();
    let a = bus.attach();
    let mut lagging = a.subscribe("ch").await.unwrap();

    for i in 0..SUBSCRIPTION_BUFFER + 10 {
        a.publish("ch", i.to_string()).await.unwrap();
    }

    for i in 0..SUBSCRIPTION_BUFFER {
        assert_eq!(lagging.try_recv(), Some(i.to_string()));
    }
    assert!(lagging.try_recv().is_none());

    a.publish("ch", "caught up".into()).await.unwrap();
    assert_eq!(recv(&mut lagging).await.as_deref(), Some("caught up"));
}

#[tokio::test]
async fn adapter_round_trips_envelopes_in_order() {
    let bus = MemoryBus::new();
    let a = BackplaneAdapter::new(Arc::new(bus.attach()), "broadcast", "presence");
    let b = BackplaneAdapter::new(Arc::new(bus.attach()), "broadcast", "presence");

    let (tx, mut rx) = mpsc::channel::<Envelope>(64);
    let subscription = b.subscribe(Arc::new(tx)).await.unwrap();
    assert!(subscription.is_active());

    for seq in 1..=20 {
        let envelope = Envelope::new("A", None, "t", Bytes::from(format!("m{seq}")), seq);
        a.publish(&envelope).await.unwrap();
    }
    for seq in 1..=20 {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.origin_node(), "A");
        assert_eq!(got.sequence(), seq);
    }

    subscription.close().await;
    assert_eq!(bus.subscriber_count("broadcast"), 0);
}

#[tokio::test]
async fn adapter_skips_malformed_frames() {
    let bus = MemoryBus::new();
    let raw = bus.attach();
    let adapter = BackplaneAdapter::new(Arc::new(bus.attach()), "broadcast", "presence");
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);
    let _subscription = adapter.subscribe(Arc::new(tx)).await.unwrap();

    raw.publish("broadcast", "garbage".into()).await.unwrap();
    adapter
        .publish(&Envelope::new("A", None, "t", Bytes::from_static(b"ok"), 1))
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.payload(), &Bytes::from_static(b"ok"));
}

#[tokio::test]
async fn hub_relays_between_clients_in_publish_order() {
    let hub = Hub::spawn("127.0.0.1:0", DEFAULT_PEER_QUEUE_LIMIT).await.unwrap();
    let a = HubClient::connect(hub.url(), fast_backoff(), Duration::from_secs(2))
        .await
        .unwrap();
    let b = HubClient::connect(hub.url(), fast_backoff(), Duration::from_secs(2))
        .await
        .unwrap();

    let mut sub_a = a.subscribe("ch").await.unwrap();
    let mut sub_b = b.subscribe("ch").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while hub.hub().subscriber_count("ch") < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    for i in 0..50 {
        a.publish("ch", format!("m{i}")).await.unwrap();
    }
    for i in 0..50 {
        assert_eq!(recv(&mut sub_b).await, Some(format!("m{i}")));
        assert_eq!(recv(&mut sub_a).await, Some(format!("m{i}")));
    }

    a.close().await;
    b.close().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn hub_client_startup_fails_without_hub() {
    let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = vacant.local_addr().unwrap();
    drop(vacant);

    let result = HubClient::connect(
        format!("ws://{addr}"),
        fast_backoff(),
        Duration::from_millis(150),
    )
    .await;
    assert!(matches!(
        result,
        Err(StartupError::BackplaneUnreachable { grace_ms: 150, .. })
    ));
}

#[tokio::test]
async fn hub_client_reconnects_and_resubscribes() {
    let hub = Hub::spawn("127.0.0.1:0", DEFAULT_PEER_QUEUE_LIMIT).await.unwrap();
    let addr = hub.local_addr();
    let client = HubClient::connect(hub.url(), fast_backoff(), Duration::from_secs(2))
        .await
        .unwrap();
    let mut sub = client.subscribe("ch").await.unwrap();

    hub.shutdown().await;
    let mut state = client.connection_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|up| !*up))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        client.publish("ch", "lost".into()).await,
        Err(Error::BackplaneUnavailable)
    ));

    let hub = Hub::spawn(&addr.to_string(), DEFAULT_PEER_QUEUE_LIMIT)
        .await
        .unwrap();
    wait_connected(&client).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while hub.hub().subscriber_count("ch") < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client.publish("ch", "back".into()).await.unwrap();
    assert_eq!(recv(&mut sub).await.as_deref(), Some("back"));

    client.close().await;
    assert!(recv(&mut sub).await.is_none());
    hub.shutdown().await;
}

#[tokio::test]
async fn hub_client_refuses_publish_when_hub_stops_reading() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (release, held) = tokio::sync::oneshot::channel::<()>();
    let stalled_hub = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // Holds the socket open without ever reading from it.
        let _ = held.await;
        drop(ws);
    });

    let client = HubClient::spawn_bounded(format!("ws://{addr}"), fast_backoff(), 4);
    wait_connected(&client).await;

    let frame = "x".repeat(64 * 1024);
    let mut accepted = 0;
    let mut refused = false;
    for _ in 0..2_000 {
        match client.publish("ch", frame.clone()).await {
            Ok(()) => accepted += 1,
            Err(Error::BackplaneUnavailable) => {
                refused = true;
                break;
            }
            Err(other) => panic!("unexpected publish error: {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(refused, "accepted {accepted} frames for a hub that never reads");
    assert!(client.is_connected());

    tokio::time::timeout(Duration::from_secs(2), client.close())
        .await
        .expect("close waited on the stalled hub");
    let _ = release.send(());
    stalled_hub.await.unwrap();
}
