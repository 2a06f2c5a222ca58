//! The HTTP surface driven in-process through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use datagate::application::gateway::TableGateway;
use datagate::application::monitor::MetricsCollector;
use datagate::cache::{CacheConfig, CacheStore, MemoryBackend, QueryCache};
use datagate::domain::Record;
use datagate::infra::http::{AppState, build_router};
use datagate::infra::memory::MemoryTables;
use datagate::realtime::{ConnectionRegistry, RealtimeHub};

fn row(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn state(tables: Option<Arc<MemoryTables>>) -> AppState {
    let cache = Arc::new(CacheStore::connected(Arc::new(MemoryBackend::new())));
    let monitor = Arc::new(MetricsCollector::default());
    let gateway = tables.map(|tables| {
        Arc::new(TableGateway::new(
            tables,
            Arc::new(QueryCache::new(cache.clone(), false)),
            CacheConfig::default(),
            monitor.clone(),
        ))
    });
    AppState {
        gateway,
        cache,
        monitor,
        realtime: RealtimeHub {
            registry: Arc::new(ConnectionRegistry::new(5)),
            outbound_buffer: 16,
        },
        feed: None,
    }
}

fn seeded() -> Arc<MemoryTables> {
    let tables = Arc::new(MemoryTables::new());
    tables.seed(
        "chats",
        (1..=45).map(|n| row(json!({"id": n, "user_id": "u1", "title": format!("chat {n}")}))),
    );
    tables.seed("chats", [row(json!({"id": 99, "user_id": "u2", "title": "other"}))]);
    tables
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// {"user_id":"u1"}
const U1_FILTER: &str = "%7B%22user_id%22%3A%22u1%22%7D";

#[tokio::test]
async fn table_pages_are_enveloped_and_cached() {
    let app = build_router(state(Some(seeded())));
    let uri = format!("/api/tables/chats?page=2&pageSize=20&order=id.asc&filters={U1_FILTER}");

    let (status, body) = get(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["cached"], false);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(20));
    assert_eq!(body["data"][0]["id"], 21);
    assert_eq!(body["pagination"]["totalItems"], 45);
    assert_eq!(body["pagination"]["totalPages"], 3);
    assert_eq!(body["pagination"]["nextPage"], 3);

    let (_, again) = get(&app, &uri).await;
    assert_eq!(again["cached"], true);
    assert_eq!(again["data"], body["data"]);
}

#[tokio::test]
async fn select_projects_columns() {
    let app = build_router(state(Some(seeded())));
    let (status, body) = get(&app, "/api/tables/chats?pageSize=1&order=id.desc&select=id,title").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0], json!({"id": 99, "title": "other"}));
}

#[tokio::test]
async fn bad_requests_are_rejected_with_error_body() {
    let app = build_router(state(Some(seeded())));

    let (status, body) = get(&app, "/api/tables/chats?filters=%7Bnope").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());

    let (status, _) = get(&app, "/api/tables/chats?order=id.sideways").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/api/tables/bad%3Bname").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_query_string_gets_error_envelope() {
    let app = build_router(state(Some(seeded())));

    let (status, body) = get(&app, "/api/tables/chats?page=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some_and(|message| !message.is_empty()));
}

#[tokio::test]
async fn tables_unavailable_without_database() {
    let app = build_router(state(None));

    let (status, body) = get(&app, "/api/tables/chats").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);

    let (status, health) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["database"], "unconfigured");
}

#[tokio::test]
async fn health_reports_components() {
    let tables = seeded();
    let app = build_router(state(Some(tables.clone())));

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "up");
    assert_eq!(body["cache"], "connected");
    assert_eq!(body["realtime"]["maxConnectionsPerUser"], 5);
    assert_eq!(body["status"], "excellent");

    tables.set_failing(true);
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["database"], "down");
}

#[tokio::test]
async fn metrics_include_request_and_cache_activity() {
    let app = build_router(state(Some(seeded())));
    get(&app, "/api/tables/chats").await;
    get(&app, "/api/tables/chats").await;

    let (status, body) = get(&app, "/api/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let data = &body["data"];
    assert_eq!(data["categories"]["api"]["count"], 2);
    assert_eq!(data["categories"]["database"]["cacheHits"], 1);
    assert_eq!(data["cache"]["hits"], 1);
    assert_eq!(data["realtime"]["connections"], 0);
    assert_eq!(data["subscriptions"], json!([]));
}

#[tokio::test]
async fn store_failure_maps_to_server_error() {
    let tables = seeded();
    let app = build_router(state(Some(tables.clone())));
    tables.set_failing(true);

    let (status, body) = get(&app, "/api/tables/chats").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
}
