//! Cache consistency across the gateway: cached pagination, invalidation on
//! write and on change-feed events, and reads while the cache is down.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use datagate::application::gateway::{TableGateway, TablePage};
use datagate::application::monitor::MetricsCollector;
use datagate::cache::{
    CacheConfig, CacheStore, Connectivity, InvalidationPlan, MemoryBackend, QueryCache,
};
use datagate::domain::{ChangeEvent, Filter, Filters, Order, Record, SelectQuery};
use datagate::infra::memory::{MemoryTables, StoreOp};

fn row(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

struct Harness {
    tables: Arc<MemoryTables>,
    backend: Arc<MemoryBackend>,
    cache: Arc<CacheStore>,
    gateway: TableGateway,
}

fn harness() -> Harness {
    let tables = Arc::new(MemoryTables::new());
    tables.seed(
        "chats",
        (1..=45).map(|n| row(json!({"id": n, "user_id": "u1", "title": format!("chat {n}")}))),
    );
    tables.seed(
        "chats",
        (46..=50).map(|n| row(json!({"id": n, "user_id": "u2", "title": format!("chat {n}")}))),
    );

    let backend = Arc::new(MemoryBackend::new());
    let cache = Arc::new(CacheStore::connected(backend.clone()));
    let queries = Arc::new(QueryCache::new(cache.clone(), false));
    let gateway = TableGateway::new(
        tables.clone(),
        queries,
        CacheConfig::default(),
        Arc::new(MetricsCollector::default()),
    );
    Harness {
        tables,
        backend,
        cache,
        gateway,
    }
}

fn user_page(page: i64) -> TablePage {
    TablePage {
        page,
        page_size: 20,
        filters: Filters::new().with("user_id", Filter::eq("u1")),
        order: vec![Order::asc("id")],
        columns: None,
    }
}

#[tokio::test]
async fn second_page_is_cached_until_a_write() {
    let h = harness();

    let first = h.gateway.paginate("chats", &user_page(2)).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.items.len(), 20);
    assert_eq!(first.items[0]["id"], 21);
    assert_eq!(first.pagination.total_items, 45);
    assert_eq!(first.pagination.total_pages, 3);
    assert_eq!(first.pagination.next_page, Some(3));
    assert_eq!(first.pagination.prev_page, Some(1));

    let again = h.gateway.paginate("chats", &user_page(2)).await.unwrap();
    assert!(again.cached);
    assert_eq!(again.items, first.items);
    assert_eq!(h.tables.calls(StoreOp::Select), 1);
    assert_eq!(h.tables.calls(StoreOp::Count), 1);

    h.gateway
        .insert("chats", &[row(json!({"id": 100, "user_id": "u1", "title": "new"}))])
        .await
        .unwrap();
    assert!(
        h.backend.keys().iter().all(|key| !key.starts_with("pagination:chats:")),
        "page entries survived a write: {:?}",
        h.backend.keys()
    );

    let fresh = h.gateway.paginate("chats", &user_page(3)).await.unwrap();
    assert!(!fresh.cached);
    assert_eq!(fresh.pagination.total_items, 46);
    assert_eq!(fresh.items.len(), 6);
    assert!(!fresh.pagination.has_next_page);
}

#[tokio::test]
async fn out_of_range_page_inputs_are_clamped() {
    let h = harness();
    let request = TablePage {
        page: 0,
        page_size: 10_000,
        ..user_page(1)
    };

    let page = h.gateway.paginate("chats", &request).await.unwrap();
    assert_eq!(page.pagination.page, 1);
    assert_eq!(page.pagination.page_size, 100);
    assert_eq!(page.items.len(), 45);
    assert_eq!(page.pagination.total_pages, 1);
}

#[tokio::test]
async fn change_event_evicts_queries_of_its_table_only() {
    let h = harness();
    let chats = SelectQuery::new().filter("user_id", Filter::eq("u2"));
    h.tables.seed("messages", [row(json!({"id": 1, "chat_id": 46}))]);
    let messages = SelectQuery::new();

    h.gateway.select("chats", &chats).await.unwrap();
    h.gateway.select("messages", &messages).await.unwrap();

    let event = ChangeEvent::update(
        "chats",
        None,
        row(json!({"id": 46, "user_id": "u2", "title": "renamed"})),
    );
    let outcome = InvalidationPlan::for_change(&event)
        .apply(&h.cache, Duration::from_secs(60))
        .await;
    assert_eq!(outcome.failures, 0);
    assert!(h.backend.contains("record:chats:46"));

    assert!(!h.gateway.select("chats", &chats).await.unwrap().from_cache);
    assert!(h.gateway.select("messages", &messages).await.unwrap().from_cache);
}

#[tokio::test]
async fn reads_keep_working_while_cache_is_down() {
    let h = harness();
    h.backend.set_available(false);

    let first = h.gateway.paginate("chats", &user_page(1)).await.unwrap();
    let second = h.gateway.paginate("chats", &user_page(1)).await.unwrap();
    assert!(!first.cached);
    assert!(!second.cached);
    assert_eq!(second.items.len(), 20);
    assert_eq!(h.cache.connectivity(), Connectivity::Disconnected);

    h.gateway
        .update(
            "chats",
            &row(json!({"title": "still writable"})),
            &Filters::new().with("id", Filter::eq(1)),
        )
        .await
        .unwrap();

    h.backend.set_available(true);
    assert_eq!(h.cache.probe().await, Connectivity::Connected);

    h.gateway.paginate("chats", &user_page(1)).await.unwrap();
    let cached = h.gateway.paginate("chats", &user_page(1)).await.unwrap();
    assert!(cached.cached);
    assert_eq!(cached.items[0]["title"], "still writable");
}
