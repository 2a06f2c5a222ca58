//! In-process relational store and change source.
//!
//! Rows live in memory and every write publishes a [`ChangeEvent`], so the
//! whole gateway/feed/registry path can run without Postgres.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::application::repos::{ChangeSource, ChangeStream, Mutation, RelationalStore, RepoError};
use crate::cache::{read_guard, write_guard};
use crate::domain::filter::{compare, validate_identifier};
use crate::domain::{ChangeEvent, Filters, Record, SelectQuery, record_id};

const SOURCE: &str = "infra::memory";
const CHANGE_BUFFER: usize = 256;

type ChangeMessage = Result<ChangeEvent, String>;

/// Which store primitive a call counter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Select,
    Count,
    Insert,
    Update,
    Delete,
}

pub struct MemoryTables {
    tables: RwLock<BTreeMap<String, Vec<Record>>>,
    changes: broadcast::Sender<ChangeMessage>,
    next_id: AtomicU64,
    failing: AtomicBool,
    refuse_subscriptions: AtomicBool,
    calls: [AtomicUsize; 5],
}

impl Default for MemoryTables {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTables {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            tables: RwLock::new(BTreeMap::new()),
            changes,
            next_id: AtomicU64::new(1),
            failing: AtomicBool::new(false),
            refuse_subscriptions: AtomicBool::new(false),
            calls: Default::default(),
        }
    }

    /// Load rows without publishing changes.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Record>) {
        let mut tables = write_guard(&self.tables, SOURCE, "seed");
        let target = tables.entry(table.to_string()).or_default();
        for mut row in rows {
            self.assign_id(&mut row);
            target.push(row);
        }
    }

    /// Make every store call fail with [`RepoError::Persistence`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make new subscriptions fail to establish.
    pub fn set_refuse_subscriptions(&self, refuse: bool) {
        self.refuse_subscriptions.store(refuse, Ordering::SeqCst);
    }

    /// Publish a change as if it came from another writer.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.changes.send(Ok(event));
    }

    /// Publish a stream-level error to every open subscription.
    pub fn publish_error(&self, message: impl Into<String>) {
        let _ = self.changes.send(Err(message.into()));
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.calls[op as usize].load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        read_guard(&self.tables, SOURCE, "rows")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn enter(&self, op: StoreOp, table: &str) -> Result<(), RepoError> {
        self.calls[op as usize].fetch_add(1, Ordering::SeqCst);
        validate_identifier(table)?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence("memory store is failing"));
        }
        Ok(())
    }

    fn assign_id(&self, row: &mut Record) {
        if record_id(row).is_none() {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            row.insert("id".to_string(), Value::from(id));
        }
    }
}

fn order_rows(rows: &mut [Record], query: &SelectQuery) {
    if query.order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for order in &query.order {
            let left = a.get(&order.column).unwrap_or(&Value::Null);
            let right = b.get(&order.column).unwrap_or(&Value::Null);
            let ordering = compare(left, right).unwrap_or(CmpOrdering::Equal);
            let ordering = if order.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != CmpOrdering::Equal {
                return ordering;
            }
        }
        CmpOrdering::Equal
    });
}

fn project(row: Record, columns: Option<&Vec<String>>) -> Record {
    match columns {
        None => row,
        Some(columns) => row
            .into_iter()
            .filter(|(column, _)| columns.iter().any(|c| c == column))
            .collect(),
    }
}

#[async_trait]
impl RelationalStore for MemoryTables {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Record>, RepoError> {
        self.enter(StoreOp::Select, table)?;
        let mut rows: Vec<Record> = read_guard(&self.tables, SOURCE, "select")
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        order_rows(&mut rows, query);

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |limit| limit as usize);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, query.columns.as_ref()))
            .collect())
    }

    async fn count(&self, table: &str, filters: &Filters) -> Result<u64, RepoError> {
        self.enter(StoreOp::Count, table)?;
        let count = read_guard(&self.tables, SOURCE, "count")
            .get(table)
            .map_or(0, |rows| rows.iter().filter(|row| filters.matches(row)).count());
        Ok(count as u64)
    }

    async fn insert(&self, table: &str, rows: &[Record]) -> Result<Mutation, RepoError> {
        self.enter(StoreOp::Insert, table)?;
        let mut inserted = Vec::with_capacity(rows.len());
        {
            let mut tables = write_guard(&self.tables, SOURCE, "insert");
            let target = tables.entry(table.to_string()).or_default();
            for row in rows {
                let mut row = row.clone();
                self.assign_id(&mut row);
                target.push(row.clone());
                inserted.push(row);
            }
        }
        for row in &inserted {
            self.publish(ChangeEvent::insert(table, row.clone()));
        }
        Ok(Mutation::from_rows(inserted))
    }

    async fn update(
        &self,
        table: &str,
        changes: &Record,
        filters: &Filters,
    ) -> Result<Mutation, RepoError> {
        self.enter(StoreOp::Update, table)?;
        let mut events = Vec::new();
        {
            let mut tables = write_guard(&self.tables, SOURCE, "update");
            if let Some(rows) = tables.get_mut(table) {
                for row in rows.iter_mut().filter(|row| filters.matches(row)) {
                    let before = row.clone();
                    for (column, value) in changes {
                        row.insert(column.clone(), value.clone());
                    }
                    events.push((before, row.clone()));
                }
            }
        }
        let mut updated = Vec::with_capacity(events.len());
        for (before, after) in events {
            self.publish(ChangeEvent::update(table, Some(before), after.clone()));
            updated.push(after);
        }
        Ok(Mutation::from_rows(updated))
    }

    async fn delete(&self, table: &str, filters: &Filters) -> Result<Mutation, RepoError> {
        self.enter(StoreOp::Delete, table)?;
        let mut removed = Vec::new();
        {
            let mut tables = write_guard(&self.tables, SOURCE, "delete");
            if let Some(rows) = tables.get_mut(table) {
                rows.retain(|row| {
                    if filters.matches(row) {
                        removed.push(row.clone());
                        false
                    } else {
                        true
                    }
                });
            }
        }
        for row in &removed {
            self.publish(ChangeEvent::delete(table, row.clone()));
        }
        Ok(Mutation::from_rows(removed))
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RepoError::from_persistence("memory store is failing"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChangeSource for MemoryTables {
    async fn subscribe(&self, table: &str, filters: &Filters) -> Result<ChangeStream, RepoError> {
        validate_identifier(table)?;
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence("change feed refused subscription"));
        }

        let receiver = self.changes.subscribe();
        let table = table.to_string();
        let filters = filters.clone();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        return Some((message.map_err(RepoError::Persistence), receiver));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let err = RepoError::from_persistence(format!(
                            "change subscription lagged by {skipped} events"
                        ));
                        return Some((Err(err), receiver));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| {
            let keep = match message {
                Ok(event) => {
                    event.table == table && event.current().is_some_and(|row| filters.matches(row))
                }
                Err(_) => true,
            };
            futures::future::ready(keep)
        });

        Ok(stream.boxed())
    }
}
