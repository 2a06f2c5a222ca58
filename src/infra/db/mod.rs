//! Postgres implementation of the relational store and its change feed.

mod listener;
mod sql;
mod util;

pub use listener::PgChangeSource;
pub use util::map_sqlx_error;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
    types::Json,
};
use tracing::instrument;

use crate::application::repos::{Mutation, RelationalStore, RepoError};
use crate::domain::{Filters, Record, SelectQuery};

#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    /// Install the change-feed trigger function and table helper.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn convert_count(value: i64) -> Result<u64, RepoError> {
        value
            .try_into()
            .map_err(|_| RepoError::from_persistence("count exceeds supported range"))
    }

    async fn fetch_rows(
        &self,
        mut qb: sqlx::QueryBuilder<'static, sqlx::Postgres>,
    ) -> Result<Vec<Record>, RepoError> {
        let rows: Vec<Json<Record>> = qb
            .build_query_scalar()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(|Json(row)| row).collect())
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    #[instrument(skip(self, query))]
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Record>, RepoError> {
        self.fetch_rows(sql::build_select(table, query)?).await
    }

    #[instrument(skip(self, filters))]
    async fn count(&self, table: &str, filters: &Filters) -> Result<u64, RepoError> {
        let mut qb = sql::build_count(table, filters)?;
        let total: i64 = qb
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Self::convert_count(total)
    }

    #[instrument(skip(self, rows), fields(row_count = rows.len()))]
    async fn insert(&self, table: &str, rows: &[Record]) -> Result<Mutation, RepoError> {
        if rows.is_empty() {
            return Ok(Mutation::default());
        }
        let runs = sql::column_runs(rows);
        if let [run] = runs.as_slice() {
            let inserted = self.fetch_rows(sql::build_insert(table, run)?).await?;
            return Ok(Mutation::from_rows(inserted));
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut inserted = Vec::with_capacity(rows.len());
        for run in runs {
            let mut qb = sql::build_insert(table, run)?;
            let batch: Vec<Json<Record>> = qb
                .build_query_scalar()
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            inserted.extend(batch.into_iter().map(|Json(row)| row));
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Mutation::from_rows(inserted))
    }

    #[instrument(skip(self, changes, filters))]
    async fn update(
        &self,
        table: &str,
        changes: &Record,
        filters: &Filters,
    ) -> Result<Mutation, RepoError> {
        let updated = self
            .fetch_rows(sql::build_update(table, changes, filters)?)
            .await?;
        Ok(Mutation::from_rows(updated))
    }

    #[instrument(skip(self, filters))]
    async fn delete(&self, table: &str, filters: &Filters) -> Result<Mutation, RepoError> {
        let deleted = self.fetch_rows(sql::build_delete(table, filters)?).await?;
        Ok(Mutation::from_rows(deleted))
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }
}
