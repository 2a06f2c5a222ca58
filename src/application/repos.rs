//! Persistence seams: the relational store and its change stream.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

use crate::domain::error::DomainError;
use crate::domain::{ChangeEvent, Filters, Record, SelectQuery};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("relational store is not configured")]
    Unconfigured,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

impl From<DomainError> for RepoError {
    fn from(err: DomainError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

/// Rows touched by a write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Mutation {
    pub affected: u64,
    pub rows: Vec<Record>,
}

impl Mutation {
    pub fn from_rows(rows: Vec<Record>) -> Self {
        Self {
            affected: rows.len() as u64,
            rows,
        }
    }
}

/// Table-oriented access to the relational store.
///
/// Table and column names are validated identifiers; values are always bound.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Record>, RepoError>;

    async fn count(&self, table: &str, filters: &Filters) -> Result<u64, RepoError>;

    async fn insert(&self, table: &str, rows: &[Record]) -> Result<Mutation, RepoError>;

    async fn update(
        &self,
        table: &str,
        changes: &Record,
        filters: &Filters,
    ) -> Result<Mutation, RepoError>;

    async fn delete(&self, table: &str, filters: &Filters) -> Result<Mutation, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, RepoError>>;

/// Source of row-level change events.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open a stream of changes on `table` whose current row image matches
    /// `filters`. An empty filter set means every row.
    async fn subscribe(&self, table: &str, filters: &Filters) -> Result<ChangeStream, RepoError>;
}
