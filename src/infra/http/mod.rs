//! HTTP surface: health, metrics, paginated table reads and the WebSocket
//! upgrade.

mod extract;
mod handlers;
mod middleware;

pub use extract::{ApiPath, ApiQuery};
pub use handlers::{HealthBody, MetricsBody, TableListQuery};
pub use middleware::RequestContext;

use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    middleware as axum_middleware,
    routing::get,
};

use crate::application::gateway::TableGateway;
use crate::application::monitor::MetricsCollector;
use crate::cache::CacheStore;
use crate::realtime::{ChangeFeedManager, RealtimeHub, ws_handler};

#[derive(Clone)]
pub struct AppState {
    /// `None` when no database is configured; table routes then answer 503.
    pub gateway: Option<Arc<TableGateway>>,
    pub cache: Arc<CacheStore>,
    pub monitor: Arc<MetricsCollector>,
    pub realtime: RealtimeHub,
    pub feed: Option<Arc<ChangeFeedManager>>,
}

impl FromRef<AppState> for RealtimeHub {
    fn from_ref(state: &AppState) -> Self {
        state.realtime.clone()
    }
}

impl FromRef<AppState> for Arc<MetricsCollector> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.monitor)
    }
}

pub fn build_router(state: AppState) -> Router {
    let monitor = Arc::clone(&state.monitor);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/metrics", get(handlers::metrics))
        .route("/api/tables/{table}", get(handlers::list_table))
        .route("/ws", get(ws_handler))
        .route_layer(axum_middleware::from_fn_with_state(
            monitor,
            middleware::observe_requests,
        ))
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
