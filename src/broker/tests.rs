use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::mpsc;

use super::message::Envelope;
use super::registry::Registry;
use super::topic::Topic;
use super::{MessageHandler, PubSub};
use crate::driver::{MemoryBroker, MemoryDriver};
use crate::utils::error::{HandlerError, PubSubError};

struct Collect {
    tx: mpsc::UnboundedSender<Envelope>,
    cancelled: Arc<AtomicUsize>,
}

impl MessageHandler for Collect {
    fn handle(&self, msg: Envelope) -> Result<(), HandlerError> {
        self.tx.send(msg).map_err(|_| HandlerError::Closed)
    }

    fn cancel(&self) -> Result<(), HandlerError> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing {
    calls: Arc<AtomicUsize>,
}

impl MessageHandler for Failing {
    fn handle(&self, _msg: Envelope) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Failed("boom".to_string()))
    }
}

fn collect() -> (Arc<Collect>, mpsc::UnboundedReceiver<Envelope>, Arc<AtomicUsize>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(Collect {
        tx,
        cancelled: cancelled.clone(),
    });
    (handler, rx, cancelled)
}

fn facade() -> (PubSub, MemoryBroker) {
    let broker = MemoryBroker::new();
    let driver: MemoryDriver = broker.connect();
    (PubSub::new(Arc::new(driver)), broker)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Option<Envelope> {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
    let got = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(!matches!(got, Ok(Some(_))), "unexpected delivery");
}

#[test]
fn test_topic_subscribe_once_per_client() {
    let (handler, _rx, _) = collect();
    let mut topic = Topic::new("channels.abc");
    assert_eq!(topic.name, "channels.abc");

    let mut registry = Registry::new();
    let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
    assert!(
        registry
            .reserve("channels.abc", "c1", handler.clone(), active.clone())
            .is_some()
    );
    assert!(
        registry
            .reserve("channels.abc", "c1", handler.clone(), active.clone())
            .is_none()
    );

    let sub = registry.remove("channels.abc", "c1").unwrap();
    assert!(topic.subscribe("c1".to_string(), sub));
    assert!(topic.unsubscribe("c1").is_some());
    assert!(topic.is_empty());
}

#[test]
fn test_registry_prunes_empty_topic() {
    let (handler, _rx, _) = collect();
    let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let mut registry = Registry::new();

    registry.reserve("t", "a", handler.clone(), active.clone());
    registry.reserve("t", "b", handler.clone(), active.clone());
    assert_eq!(registry.len(), 2);

    registry.remove("t", "a");
    assert!(registry.contains_topic("t"));
    assert!(registry.contains("t", "b"));

    registry.remove("t", "b");
    assert!(!registry.contains_topic("t"));
    assert!(registry.is_empty());
}

#[test]
fn test_registry_ticket_guards_attach_and_discard() {
    let (handler, _rx, _) = collect();
    let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let mut registry = Registry::new();

    let first = registry
        .reserve("t", "a", handler.clone(), active.clone())
        .unwrap();
    registry.remove("t", "a");
    let second = registry
        .reserve("t", "a", handler.clone(), active.clone())
        .unwrap();
    assert_ne!(first, second);

    // a stale reservation can neither attach nor discard the new one
    assert!(!registry.attach("t", "a", first, crate::driver::SubscriptionHandle(1)));
    registry.discard("t", "a", first);
    assert!(registry.contains("t", "a"));

    assert!(registry.attach("t", "a", second, crate::driver::SubscriptionHandle(2)));
    registry.discard("t", "a", second);
    assert!(!registry.contains("t", "a"));
}

#[tokio::test]
async fn test_publish_empty_topic() {
    let (pubsub, _broker) = facade();
    let err = pubsub
        .publish("", &Envelope::new("", b"x".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::EmptyTopic));
}

#[tokio::test]
async fn test_publish_envelope_without_channel() {
    let (pubsub, _broker) = facade();
    let (handler, mut rx, _) = collect();
    pubsub.subscribe("c1", "channels.>", handler).await.unwrap();

    let err = pubsub
        .publish("abc", &Envelope::new("", b"x".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::EmptyTopic));
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_subscribe_argument_errors() {
    let (pubsub, _broker) = facade();
    let (handler, _rx, _) = collect();

    // empty topic wins even when the ID is empty too
    let err = pubsub.subscribe("", "", handler.clone()).await.unwrap_err();
    assert!(matches!(err, PubSubError::EmptyTopic));
    let err = pubsub.subscribe("c1", "", handler.clone()).await.unwrap_err();
    assert!(matches!(err, PubSubError::EmptyTopic));
    let err = pubsub
        .subscribe("", "channels.abc", handler.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::EmptyId));

    let err = pubsub.unsubscribe("", "").await.unwrap_err();
    assert!(matches!(err, PubSubError::EmptyTopic));
    let err = pubsub.unsubscribe("", "channels.abc").await.unwrap_err();
    assert!(matches!(err, PubSubError::EmptyId));
    assert_eq!(pubsub.subscription_count(), 0);
}

#[tokio::test]
async fn test_double_subscribe_and_unsubscribe() {
    let (pubsub, _broker) = facade();
    let (handler, _rx, cancelled) = collect();

    pubsub
        .subscribe("c1", "channels.abc", handler.clone())
        .await
        .unwrap();
    let err = pubsub
        .subscribe("c1", "channels.abc", handler.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::AlreadySubscribed));
    assert_eq!(pubsub.subscription_count(), 1);

    pubsub.unsubscribe("c1", "channels.abc").await.unwrap();
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    let err = pubsub.unsubscribe("c1", "channels.abc").await.unwrap_err();
    assert!(matches!(err, PubSubError::NotSubscribed));
    assert!(!pubsub.is_subscribed("c1", "channels.abc"));
}

#[tokio::test]
async fn test_same_client_different_topics() {
    let (pubsub, _broker) = facade();
    let (handler, _rx, _) = collect();

    pubsub.subscribe("c1", "channels.a", handler.clone()).await.unwrap();
    pubsub.subscribe("c1", "channels.b", handler.clone()).await.unwrap();
    pubsub.subscribe("c2", "channels.a", handler.clone()).await.unwrap();
    assert_eq!(pubsub.subscription_count(), 3);

    pubsub.unsubscribe("c1", "channels.a").await.unwrap();
    assert!(pubsub.is_subscribed("c1", "channels.b"));
    assert!(pubsub.is_subscribed("c2", "channels.a"));
}

#[tokio::test]
async fn test_payload_round_trip() {
    let (pubsub, _broker) = facade();
    let (handler, mut rx, _) = collect();
    pubsub.subscribe("c1", "channels.abc", handler).await.unwrap();

    let large: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    for payload in [Vec::new(), vec![0x7f], large] {
        let msg = Envelope::new("abc", payload.clone())
            .with_publisher("thing-1")
            .with_protocol("coap");
        pubsub.publish("abc", &msg).await.unwrap();

        let got = recv(&mut rx).await.expect("message delivered");
        assert_eq!(got.payload, payload);
        assert_eq!(got, msg);
    }
}

#[tokio::test]
async fn test_wildcard_addressing() {
    let (pubsub, _broker) = facade();
    let (all, mut rx_all, _) = collect();
    let (exact, mut rx_exact, _) = collect();
    pubsub.subscribe("all", "channels.>", all).await.unwrap();
    pubsub.subscribe("exact", "channels.abc", exact).await.unwrap();

    pubsub
        .publish("abc", &Envelope::new("abc", b"plain".to_vec()))
        .await
        .unwrap();
    pubsub
        .publish(
            "abc",
            &Envelope::new("abc", b"sub".to_vec()).with_subtopic("temp"),
        )
        .await
        .unwrap();

    assert_eq!(recv(&mut rx_all).await.unwrap().payload, b"plain");
    assert_eq!(recv(&mut rx_all).await.unwrap().payload, b"sub");
    assert_eq!(recv(&mut rx_exact).await.unwrap().payload, b"plain");
    assert_silent(&mut rx_exact).await;
}

#[tokio::test]
async fn test_handler_error_keeps_subscription() {
    let (pubsub, _broker) = facade();
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = Arc::new(Failing {
        calls: calls.clone(),
    });
    pubsub.subscribe("f", "channels.abc", failing).await.unwrap();
    let (handler, mut rx, _) = collect();
    pubsub.subscribe("ok", "channels.abc", handler).await.unwrap();

    for _ in 0..2 {
        pubsub
            .publish("abc", &Envelope::new("abc", b"x".to_vec()))
            .await
            .unwrap();
        assert!(recv(&mut rx).await.is_some());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(pubsub.is_subscribed("f", "channels.abc"));
}

#[tokio::test]
async fn test_undecodable_message_is_dropped() {
    let (pubsub, broker) = facade();
    let (handler, mut rx, _) = collect();
    pubsub.subscribe("c1", "channels.abc", handler).await.unwrap();

    // field 1 claims 5 bytes but only 1 follows
    assert_eq!(broker.route("channels.abc", &[0x0A, 0x05, b'a']), 1);
    pubsub
        .publish("abc", &Envelope::new("abc", b"after".to_vec()))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await.unwrap().payload, b"after");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (pubsub, _broker) = facade();
    let (handler, mut rx, _) = collect();
    pubsub.subscribe("c1", "channels.abc", handler).await.unwrap();
    pubsub.unsubscribe("c1", "channels.abc").await.unwrap();

    pubsub
        .publish("abc", &Envelope::new("abc", b"x".to_vec()))
        .await
        .unwrap();
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_close_cancels_every_handler() {
    let (pubsub, _broker) = facade();
    let (h1, _rx1, c1) = collect();
    let (h2, _rx2, c2) = collect();
    pubsub.subscribe("a", "channels.x", h1).await.unwrap();
    pubsub.subscribe("b", "channels.y", h2).await.unwrap();

    pubsub.close().await;
    assert_eq!(c1.load(Ordering::SeqCst), 1);
    assert_eq!(c2.load(Ordering::SeqCst), 1);
    assert_eq!(pubsub.subscription_count(), 0);

    let err = pubsub
        .publish("x", &Envelope::new("x", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Driver(_)));
}

#[tokio::test]
async fn test_empty_queue_name_means_fanout() {
    let broker = MemoryBroker::new();
    let pubsub = PubSub::with_queue(Arc::new(broker.connect()), Some(String::new()));
    let (h1, mut rx1, _) = collect();
    let (h2, mut rx2, _) = collect();
    pubsub.subscribe("a", "channels.abc", h1).await.unwrap();
    pubsub.subscribe("b", "channels.abc", h2).await.unwrap();

    pubsub
        .publish("abc", &Envelope::new("abc", b"x".to_vec()))
        .await
        .unwrap();
    assert!(recv(&mut rx1).await.is_some());
    assert!(recv(&mut rx2).await.is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn queue_group_delivers_each_message_once(members in 1usize..5, messages in 0usize..24) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let received = rt.block_on(async move {
            let broker = MemoryBroker::new();
            let pubsub = PubSub::with_queue(
                Arc::new(broker.connect()),
                Some("workers".to_string()),
            );

            let (tx, mut rx) = mpsc::unbounded_channel();
            for i in 0..members {
                let handler = Arc::new(Collect {
                    tx: tx.clone(),
                    cancelled: Arc::new(AtomicUsize::new(0)),
                });
                pubsub
                    .subscribe(&format!("member-{i}"), "channels.>", handler)
                    .await
                    .unwrap();
            }
            drop(tx);

            for n in 0..messages {
                let msg = Envelope::new("abc", n.to_be_bytes().to_vec());
                pubsub.publish("abc", &msg).await.unwrap();
            }

            let mut seen = Vec::new();
            while let Ok(Some(msg)) =
                tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
            {
                seen.push(msg.payload);
            }
            pubsub.close().await;
            seen
        });

        prop_assert_eq!(received.len(), messages);
        let mut indices: Vec<usize> = received
            .iter()
            .map(|p| usize::from_be_bytes(p.as_slice().try_into().unwrap()))
            .collect();
        indices.sort_unstable();
        prop_assert_eq!(indices, (0..messages).collect::<Vec<_>>());
    }
}
