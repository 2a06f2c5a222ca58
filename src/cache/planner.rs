//! Invalidation plans.
//!
//! Turns a write or a batch of change events into the cache actions that keep
//! readers from seeing stale rows. Actions run in a fixed order: table query
//! patterns, then per-record entries, then the coarser derived patterns.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use super::keys::{
    DASHBOARD_NAMESPACE, PAGINATION_NAMESPACE, QUERY_NAMESPACE, STATS_NAMESPACE,
    namespace_pattern, record_key, table_pattern,
};
use super::store::CacheStore;
use crate::domain::{ChangeEvent, ChangeKind, Record};

/// What should happen to one per-record entry.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordAction {
    Write(Record),
    Remove,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct InvalidationPlan {
    /// `query:<table>:*` patterns.
    pub table_patterns: BTreeSet<String>,
    /// Per-record keys, latest action wins.
    pub records: BTreeMap<String, RecordAction>,
    /// Pagination, stats and dashboard patterns.
    pub derived_patterns: BTreeSet<String>,
}

/// Counts from executing a plan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub evicted: u64,
    pub records_written: u64,
    pub records_removed: u64,
    pub failures: u64,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ table_patterns: {}, records: {}, derived_patterns: {} }}",
            self.table_patterns.len(),
            self.records.len(),
            self.derived_patterns.len(),
        )
    }
}

impl InvalidationPlan {
    /// Plan for a write issued through the gateway.
    pub fn for_write(table: &str) -> Self {
        let mut plan = Self::default();
        plan.table_patterns
            .insert(table_pattern(QUERY_NAMESPACE, table));
        plan.derived_patterns
            .insert(table_pattern(PAGINATION_NAMESPACE, table));
        plan.derived_patterns
            .insert(table_pattern(STATS_NAMESPACE, table));
        plan
    }

    /// Plan for a single change observed on the feed.
    pub fn for_change(event: &ChangeEvent) -> Self {
        Self::from_changes(std::slice::from_ref(event))
    }

    /// Merge a batch of changes, in arrival order, into one plan.
    pub fn from_changes(events: &[ChangeEvent]) -> Self {
        let mut plan = Self::default();
        let mut touched_any = false;

        for event in events {
            touched_any = true;
            let table = event.table.as_str();
            plan.table_patterns
                .insert(table_pattern(QUERY_NAMESPACE, table));
            plan.derived_patterns
                .insert(table_pattern(PAGINATION_NAMESPACE, table));
            plan.derived_patterns
                .insert(table_pattern(STATS_NAMESPACE, table));

            let Some(id) = event.record_id() else {
                debug!(table, kind = event.event_type.as_str(), "Change carries no record id");
                continue;
            };
            let action = match (event.event_type, event.after.as_ref()) {
                (ChangeKind::Delete, _) | (_, None) => RecordAction::Remove,
                (ChangeKind::Insert | ChangeKind::Update, Some(after)) => {
                    RecordAction::Write(after.clone())
                }
            };
            plan.records.insert(record_key(table, &id), action);
        }

        if touched_any {
            plan.derived_patterns
                .insert(namespace_pattern(DASHBOARD_NAMESPACE));
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.table_patterns.is_empty() && self.records.is_empty() && self.derived_patterns.is_empty()
    }

    /// Run the plan against `store`. Failures are logged and counted, never
    /// returned: the relational store stays the source of truth.
    pub async fn apply(&self, store: &CacheStore, record_ttl: Duration) -> InvalidationOutcome {
        let mut outcome = InvalidationOutcome::default();
        if !store.is_enabled() {
            return outcome;
        }

        for pattern in &self.table_patterns {
            match store.delete_pattern(pattern).await {
                Ok(removed) => outcome.evicted += removed,
                Err(err) => {
                    outcome.failures += 1;
                    warn!(pattern = %pattern, error = %err, "Failed to invalidate table queries");
                }
            }
        }

        for (key, action) in &self.records {
            let result = match action {
                RecordAction::Write(record) => store
                    .set(key, record, record_ttl)
                    .await
                    .map(|()| outcome.records_written += 1),
                RecordAction::Remove => store
                    .delete(key)
                    .await
                    .map(|_| outcome.records_removed += 1),
            };
            if let Err(err) = result {
                outcome.failures += 1;
                warn!(key = %key, error = %err, "Failed to refresh record entry");
            }
        }

        for pattern in &self.derived_patterns {
            match store.delete_pattern(pattern).await {
                Ok(removed) => outcome.evicted += removed,
                Err(err) => {
                    outcome.failures += 1;
                    warn!(pattern = %pattern, error = %err, "Failed to invalidate derived caches");
                }
            }
        }

        outcome
    }
}
