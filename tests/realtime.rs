//! Writes through the gateway reach subscribed realtime connections via the
//! change feed, and stale caches are gone by the time they do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::timeout;

use datagate::application::gateway::TableGateway;
use datagate::application::monitor::MetricsCollector;
use datagate::application::repos::RelationalStore;
use datagate::cache::{CacheConfig, CacheStore, MemoryBackend, QueryCache};
use datagate::domain::{Filter, Filters, Record, SelectQuery};
use datagate::infra::memory::MemoryTables;
use datagate::realtime::{
    CHANGE_EVENT, ChangeFeedManager, ChangePipeline, ConnectionRegistry, PushTransport,
    SubscriptionHandlers, SubscriptionState, TransportError,
};

fn row(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

struct Recorder {
    tx: UnboundedSender<(String, Value)>,
}

#[async_trait]
impl PushTransport for Recorder {
    async fn emit(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        self.tx
            .send((event.to_string(), payload.clone()))
            .map_err(|_| TransportError::Closed)
    }
}

fn recorder() -> (Arc<Recorder>, UnboundedReceiver<(String, Value)>) {
    let (tx, rx) = unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

struct Stack {
    tables: Arc<MemoryTables>,
    backend: Arc<MemoryBackend>,
    registry: Arc<ConnectionRegistry>,
    gateway: TableGateway,
    feed: ChangeFeedManager,
}

fn stack() -> Stack {
    let tables = Arc::new(MemoryTables::new());
    let backend = Arc::new(MemoryBackend::new());
    let cache = Arc::new(CacheStore::connected(backend.clone()));
    let monitor = Arc::new(MetricsCollector::default());
    let registry = Arc::new(ConnectionRegistry::new(5).with_monitor(monitor.clone()));
    let gateway = TableGateway::new(
        tables.clone(),
        Arc::new(QueryCache::new(cache.clone(), false)),
        CacheConfig::default(),
        monitor.clone(),
    );
    let pipeline = Arc::new(
        ChangePipeline::new(cache, Duration::from_secs(60))
            .with_registry(registry.clone())
            .with_monitor(monitor.clone()),
    );
    let feed = ChangeFeedManager::new(tables.clone(), pipeline, 32);
    Stack {
        tables,
        backend,
        registry,
        gateway,
        feed,
    }
}

async fn next(rx: &mut UnboundedReceiver<(String, Value)>) -> (String, Value) {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no delivery within a second")
        .expect("transport dropped")
}

#[tokio::test]
async fn insert_fans_out_to_table_subscribers_only() {
    let s = stack();
    let id = s
        .feed
        .subscribe("messages", Filters::new(), SubscriptionHandlers::silent())
        .await;
    assert_eq!(s.feed.state(id), SubscriptionState::Subscribed);

    let (watching, mut watching_rx) = recorder();
    let (idle, mut idle_rx) = recorder();
    s.registry.register("c1", "u1", watching).unwrap();
    s.registry.register("c2", "u2", idle).unwrap();
    s.registry.add_subscription("c1", "messages").unwrap();

    s.gateway
        .insert("messages", &[row(json!({"id": 10, "chat_id": 1, "body": "hi"}))])
        .await
        .unwrap();

    let (event, payload) = next(&mut watching_rx).await;
    assert_eq!(event, CHANGE_EVENT);
    assert_eq!(payload["eventType"], "INSERT");
    assert_eq!(payload["table"], "messages");
    assert_eq!(payload["after"]["body"], "hi");
    assert!(idle_rx.try_recv().is_err());

    assert!(s.backend.contains("record:messages:10"));
}

#[tokio::test]
async fn feed_event_evicts_cache_filled_after_write() {
    let s = stack();
    let chats = SelectQuery::new().filter("user_id", Filter::eq("u1"));
    s.feed
        .subscribe("chats", Filters::new(), SubscriptionHandlers::silent())
        .await;
    let (conn, mut rx) = recorder();
    s.registry.register("c1", "u1", conn).unwrap();
    s.registry.add_subscription("c1", "chats").unwrap();

    s.tables.seed("chats", [row(json!({"id": 1, "user_id": "u1", "title": "a"}))]);
    let before = s.gateway.select("chats", &chats).await.unwrap();
    assert_eq!(before.value[0]["title"], "a");
    assert!(s.gateway.select("chats", &chats).await.unwrap().from_cache);

    // A writer that bypasses the gateway.
    s.tables
        .update(
            "chats",
            &row(json!({"title": "b"})),
            &Filters::new().with("id", Filter::eq(1)),
        )
        .await
        .unwrap();
    let (_, payload) = next(&mut rx).await;
    assert_eq!(payload["eventType"], "UPDATE");
    assert_eq!(payload["before"]["title"], "a");

    let after = s.gateway.select("chats", &chats).await.unwrap();
    assert!(!after.from_cache);
    assert_eq!(after.value[0]["title"], "b");
}

#[tokio::test]
async fn broken_connection_does_not_block_others() {
    let s = stack();
    s.feed
        .subscribe("chats", Filters::new(), SubscriptionHandlers::silent())
        .await;

    let (healthy, mut healthy_rx) = recorder();
    let (broken, broken_rx) = recorder();
    drop(broken_rx);
    s.registry.register("ok", "u1", healthy).unwrap();
    s.registry.register("gone", "u1", broken).unwrap();
    s.registry.add_subscription("ok", "chats").unwrap();
    s.registry.add_subscription("gone", "chats").unwrap();

    s.gateway
        .insert("chats", &[row(json!({"id": 5, "user_id": "u1"}))])
        .await
        .unwrap();

    let (_, payload) = next(&mut healthy_rx).await;
    assert_eq!(payload["eventType"], "INSERT");
    assert_eq!(s.registry.stats().connections, 2);
}

#[tokio::test]
async fn unsubscribed_feed_stops_delivering() {
    let s = stack();
    let id = s
        .feed
        .subscribe("chats", Filters::new(), SubscriptionHandlers::silent())
        .await;
    let (conn, mut rx) = recorder();
    s.registry.register("c1", "u1", conn).unwrap();
    s.registry.add_subscription("c1", "chats").unwrap();

    s.feed.unsubscribe(id).unwrap();
    assert_eq!(s.feed.state(id), SubscriptionState::Unsubscribed);

    s.gateway
        .insert("chats", &[row(json!({"id": 1, "user_id": "u1"}))])
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn overlapping_subscriptions_deliver_each_change_once() {
    let s = stack();
    for _ in 0..2 {
        s.feed
            .subscribe("chats", Filters::new(), SubscriptionHandlers::silent())
            .await;
    }
    let (conn, mut rx) = recorder();
    s.registry.register("c1", "u1", conn).unwrap();
    s.registry.add_subscription("c1", "chats").unwrap();

    s.gateway
        .insert("chats", &[row(json!({"id": 7, "user_id": "u1"}))])
        .await
        .unwrap();

    let (_, payload) = next(&mut rx).await;
    assert_eq!(payload["after"]["id"], 7);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}
