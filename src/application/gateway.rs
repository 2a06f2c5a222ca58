//! Table gateway.
//!
//! Cached reads and invalidate-after-write mutations over a
//! [`RelationalStore`]. Every call is recorded by the [`MetricsCollector`].

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::monitor::{Category, MetricsCollector};
use super::repos::{Mutation, RelationalStore, RepoError};
use crate::cache::keys::{count_key, make_key, query_key};
use crate::cache::{
    CacheConfig, CacheStore, Cached, InvalidationPlan, PageResult, PageSlice, PaginationEngine,
    QueryCache,
};
use crate::domain::filter::validate_identifier;
use crate::domain::{Filters, Order, Record, SelectQuery};

/// Page request against a single table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TablePage {
    pub page: i64,
    pub page_size: i64,
    pub filters: Filters,
    pub order: Vec<Order>,
    pub columns: Option<Vec<String>>,
}

pub struct TableGateway {
    store: Arc<dyn RelationalStore>,
    queries: Arc<QueryCache>,
    pages: PaginationEngine,
    config: CacheConfig,
    monitor: Arc<MetricsCollector>,
}

impl TableGateway {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        queries: Arc<QueryCache>,
        config: CacheConfig,
        monitor: Arc<MetricsCollector>,
    ) -> Self {
        let pages = PaginationEngine::new(Arc::clone(&queries), config.max_page_size);
        Self {
            store,
            queries,
            pages,
            config,
            monitor,
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        self.queries.store()
    }

    pub fn relational(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    fn observe(&self, op: &str, table: &str, started: Instant, success: bool, from_cache: bool) {
        self.monitor.record(
            Category::Database,
            &format!("{op}:{table}"),
            started.elapsed(),
            success,
            from_cache,
        );
    }

    #[instrument(skip(self, query))]
    pub async fn select(
        &self,
        table: &str,
        query: &SelectQuery,
    ) -> Result<Cached<Vec<Record>>, RepoError> {
        validate_identifier(table)?;
        let started = Instant::now();
        let key = query_key(table, query);
        let ttl = self.config.ttl_for_table(table);

        let result = self
            .queries
            .cached(&key, ttl, || self.store.select(table, query))
            .await;
        self.observe(
            "select",
            table,
            started,
            result.is_ok(),
            result.as_ref().is_ok_and(|cached| cached.from_cache),
        );
        result
    }

    #[instrument(skip(self, filters))]
    pub async fn count(&self, table: &str, filters: &Filters) -> Result<Cached<u64>, RepoError> {
        validate_identifier(table)?;
        let started = Instant::now();
        let key = count_key(table, filters);
        let ttl = self.config.ttl_for_table(table);

        let result = self
            .queries
            .cached(&key, ttl, || self.store.count(table, filters))
            .await;
        self.observe(
            "count",
            table,
            started,
            result.is_ok(),
            result.as_ref().is_ok_and(|cached| cached.from_cache),
        );
        result
    }

    #[instrument(skip(self, rows), fields(row_count = rows.len()))]
    pub async fn insert(&self, table: &str, rows: &[Record]) -> Result<Mutation, RepoError> {
        validate_identifier(table)?;
        let started = Instant::now();
        let result = self.store.insert(table, rows).await;
        self.finish_write("insert", table, started, result).await
    }

    #[instrument(skip(self, changes, filters))]
    pub async fn update(
        &self,
        table: &str,
        changes: &Record,
        filters: &Filters,
    ) -> Result<Mutation, RepoError> {
        validate_identifier(table)?;
        let started = Instant::now();
        let result = self.store.update(table, changes, filters).await;
        self.finish_write("update", table, started, result).await
    }

    #[instrument(skip(self, filters))]
    pub async fn delete(&self, table: &str, filters: &Filters) -> Result<Mutation, RepoError> {
        validate_identifier(table)?;
        let started = Instant::now();
        let result = self.store.delete(table, filters).await;
        self.finish_write("delete", table, started, result).await
    }

    /// Invalidate only after the store accepted the write, then hand back the
    /// result.
    async fn finish_write(
        &self,
        op: &str,
        table: &str,
        started: Instant,
        result: Result<Mutation, RepoError>,
    ) -> Result<Mutation, RepoError> {
        if result.is_ok() {
            self.invalidate(table).await;
        }
        self.observe(op, table, started, result.is_ok(), false);
        result
    }

    /// Evict every cached query and page of `table`.
    pub async fn invalidate(&self, table: &str) {
        let outcome = InvalidationPlan::for_write(table)
            .apply(self.cache(), self.config.record_ttl)
            .await;
        debug!(
            table,
            evicted = outcome.evicted,
            failures = outcome.failures,
            "Invalidated table caches"
        );
    }

    /// One cached page of `table`. Rows and total count are fetched
    /// concurrently and uncached; the assembled page is cached once.
    #[instrument(skip(self, request))]
    pub async fn paginate(
        &self,
        table: &str,
        request: &TablePage,
    ) -> Result<PageResult<Record>, RepoError> {
        validate_identifier(table)?;
        let started = Instant::now();
        let ttl = self.config.ttl_for_table(table);
        let base_key = if request.order.is_empty() && request.columns.is_none() {
            table.to_string()
        } else {
            make_key(
                table,
                &json!({ "order": request.order, "columns": request.columns }),
            )
        };

        let result = self
            .pages
            .paginate(
                &base_key,
                request.page,
                request.page_size,
                &request.filters,
                ttl,
                |offset, limit, filters| async move {
                    let query = SelectQuery {
                        columns: request.columns.clone(),
                        filters: filters.clone(),
                        order: request.order.clone(),
                        limit: Some(limit),
                        offset: Some(offset),
                    };
                    let (items, total_count) = tokio::try_join!(
                        self.store.select(table, &query),
                        self.store.count(table, &filters),
                    )?;
                    Ok::<_, RepoError>(PageSlice { items, total_count })
                },
            )
            .await;

        self.observe(
            "paginate",
            table,
            started,
            result.is_ok(),
            result.as_ref().is_ok_and(|page| page.cached),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::cache::MemoryBackend;
    use crate::domain::Filter;
    use crate::infra::memory::{MemoryTables, StoreOp};

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    struct Fixture {
        tables: Arc<MemoryTables>,
        backend: Arc<MemoryBackend>,
        monitor: Arc<MetricsCollector>,
        gateway: TableGateway,
    }

    fn fixture() -> Fixture {
        let tables = Arc::new(MemoryTables::new());
        tables.seed(
            "chats",
            (1..=45).map(|n| {
                let user = if n % 2 == 0 { "u1" } else { "u2" };
                row(json!({"id": n, "user_id": user}))
            }),
        );
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(CacheStore::connected(backend.clone()));
        let queries = Arc::new(QueryCache::new(cache, false));
        let monitor = Arc::new(MetricsCollector::default());
        let gateway = TableGateway::new(
            tables.clone(),
            queries,
            CacheConfig::default(),
            monitor.clone(),
        );
        Fixture {
            tables,
            backend,
            monitor,
            gateway,
        }
    }

    #[tokio::test]
    async fn repeated_select_is_served_from_cache() {
        let fx = fixture();
        let query = SelectQuery::new().filter("user_id", Filter::eq("u1"));

        let first = fx.gateway.select("chats", &query).await.unwrap();
        let second = fx.gateway.select("chats", &query).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.value, second.value);
        assert_eq!(fx.tables.calls(StoreOp::Select), 1);
        assert_eq!(fx.monitor.summary(Category::Database).cache_hits, 1);
    }

    #[tokio::test]
    async fn write_invalidates_cached_select() {
        let fx = fixture();
        let query = SelectQuery::new().filter("user_id", Filter::eq("u9"));
        assert!(fx.gateway.select("chats", &query).await.unwrap().value.is_empty());

        fx.gateway
            .insert("chats", &[row(json!({"user_id": "u9"}))])
            .await
            .unwrap();

        let after = fx.gateway.select("chats", &query).await.unwrap();
        assert!(!after.from_cache);
        assert_eq!(after.value.len(), 1);
    }

    #[tokio::test]
    async fn failed_write_keeps_cache_and_propagates() {
        let fx = fixture();
        let query = SelectQuery::new();
        fx.gateway.select("chats", &query).await.unwrap();
        let cached_keys = fx.backend.keys();

        fx.tables.set_failing(true);
        let err = fx
            .gateway
            .delete("chats", &Filters::new().with("id", Filter::eq(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Persistence(_)));
        assert_eq!(fx.backend.keys(), cached_keys);
        assert_eq!(fx.monitor.summary(Category::Database).error_count, 1);
    }

    #[tokio::test]
    async fn paginate_caches_whole_page() {
        let fx = fixture();
        let request = TablePage {
            page: 1,
            page_size: 20,
            ..Default::default()
        };

        let first = fx.gateway.paginate("chats", &request).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.items.len(), 20);
        assert_eq!(first.pagination.total_items, 45);
        assert_eq!(first.pagination.total_pages, 3);

        let second = fx.gateway.paginate("chats", &request).await.unwrap();
        assert!(second.cached);
        assert_eq!(fx.tables.calls(StoreOp::Select), 1);
        assert_eq!(fx.tables.calls(StoreOp::Count), 1);

        fx.gateway
            .update(
                "chats",
                &row(json!({"user_id": "u3"})),
                &Filters::new().with("id", Filter::eq(1)),
            )
            .await
            .unwrap();
        let third = fx.gateway.paginate("chats", &request).await.unwrap();
        assert!(!third.cached);
    }

    #[tokio::test]
    async fn cache_outage_still_serves_reads() {
        let fx = fixture();
        fx.backend.set_available(false);
        let rows = fx.gateway.select("chats", &SelectQuery::new()).await.unwrap();
        assert_eq!(rows.value.len(), 45);
        assert!(!rows.from_cache);
    }

    #[tokio::test]
    async fn invalid_table_is_rejected_before_io() {
        let fx = fixture();
        let err = fx
            .gateway
            .count("chats\"; --", &Filters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidInput { .. }));
        assert_eq!(fx.tables.calls(StoreOp::Count), 0);
    }
}
