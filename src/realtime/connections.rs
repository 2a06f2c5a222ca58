//! Realtime connection registry.
//!
//! Tracks live push connections per user, their subscription keys and last
//! activity. Fan-out is best effort: each delivery is independent, failures
//! are logged and counted, never retried.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant as StdInstant};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::monitor::{Category, MetricsCollector};
use crate::cache::{lock_guard, read_guard, write_guard};

const SOURCE: &str = "realtime::connections";
const METRIC_BROADCAST_FAILED: &str = "datagate_broadcast_failed_total";
const METRIC_CONNECTIONS: &str = "datagate_realtime_connections";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("user `{user_id}` already has {limit} live connections")]
    ConnectionLimit { user_id: String, limit: usize },
    #[error("connection `{0}` is already registered")]
    DuplicateConnection(String),
    #[error("unknown connection `{0}`")]
    UnknownConnection(String),
}

/// Push channel to one client.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn emit(&self, event: &str, payload: &Value) -> Result<(), TransportError>;

    /// Called once when the registry drops the connection.
    fn close(&self) {}
}

pub struct Connection {
    id: String,
    user_id: String,
    transport: Arc<dyn PushTransport>,
    connected_at: OffsetDateTime,
    last_activity: Mutex<Instant>,
    subscriptions: RwLock<HashSet<String>>,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        read_guard(&self.subscriptions, SOURCE, "is_subscribed").contains(key)
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock_guard(&self.last_activity, SOURCE, "idle_for"))
    }

    fn info(&self, now: Instant) -> ConnectionInfo {
        let mut subscriptions: Vec<String> = read_guard(&self.subscriptions, SOURCE, "info")
            .iter()
            .cloned()
            .collect();
        subscriptions.sort();
        ConnectionInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            connected_at: self.connected_at,
            idle_ms: self.idle_for(now).as_millis() as u64,
            subscriptions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    pub idle_ms: u64,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub subscriptions: usize,
    pub max_connections_per_user: usize,
}

pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    by_user: DashMap<String, HashSet<String>>,
    max_per_user: usize,
    monitor: Option<Arc<MetricsCollector>>,
}

impl ConnectionRegistry {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            max_per_user: max_per_user.max(1),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<MetricsCollector>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn max_connections_per_user(&self) -> usize {
        self.max_per_user
    }

    /// Whether `user_id` may open another connection.
    pub fn can_accept(&self, user_id: &str) -> bool {
        self.by_user
            .get(user_id)
            .map_or(0, |connections| connections.len())
            < self.max_per_user
    }

    pub fn register(
        &self,
        conn_id: &str,
        user_id: &str,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Arc<Connection>, RegistryError> {
        if self.connections.contains_key(conn_id) {
            return Err(RegistryError::DuplicateConnection(conn_id.to_string()));
        }

        // Lock order: `by_user` shard, then `connections` shard.
        let mut owned = self.by_user.entry(user_id.to_string()).or_default();
        if owned.len() >= self.max_per_user {
            return Err(RegistryError::ConnectionLimit {
                user_id: user_id.to_string(),
                limit: self.max_per_user,
            });
        }

        let connection = Arc::new(Connection {
            id: conn_id.to_string(),
            user_id: user_id.to_string(),
            transport,
            connected_at: OffsetDateTime::now_utc(),
            last_activity: Mutex::new(Instant::now()),
            subscriptions: RwLock::new(HashSet::new()),
        });
        let inserted = match self.connections.entry(conn_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
                true
            }
        };
        if !inserted {
            // Lost a race with a concurrent registration of the same id.
            drop(owned);
            self.by_user.remove_if(user_id, |_, owned| owned.is_empty());
            return Err(RegistryError::DuplicateConnection(conn_id.to_string()));
        }
        owned.insert(conn_id.to_string());
        drop(owned);

        gauge!(METRIC_CONNECTIONS).set(self.connections.len() as f64);
        info!(conn_id, user_id, "Realtime connection registered");
        Ok(connection)
    }

    pub fn remove(&self, conn_id: &str) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(conn_id)?;
        if let Some(mut owned) = self.by_user.get_mut(&connection.user_id) {
            owned.remove(conn_id);
        }
        self.by_user
            .remove_if(&connection.user_id, |_, owned| owned.is_empty());
        connection.transport.close();

        gauge!(METRIC_CONNECTIONS).set(self.connections.len() as f64);
        info!(conn_id, user_id = %connection.user_id, "Realtime connection removed");
        Some(connection)
    }

    /// Refresh last activity. Returns false for unknown connections.
    pub fn touch(&self, conn_id: &str) -> bool {
        match self.connections.get(conn_id) {
            Some(connection) => {
                *lock_guard(&connection.last_activity, SOURCE, "touch") = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn add_subscription(&self, conn_id: &str, key: &str) -> Result<(), RegistryError> {
        let connection = self
            .connections
            .get(conn_id)
            .ok_or_else(|| RegistryError::UnknownConnection(conn_id.to_string()))?;
        write_guard(&connection.subscriptions, SOURCE, "add_subscription").insert(key.to_string());
        debug!(conn_id, key, "Subscription added");
        Ok(())
    }

    pub fn remove_subscription(&self, conn_id: &str, key: &str) -> Result<(), RegistryError> {
        let connection = self
            .connections
            .get(conn_id)
            .ok_or_else(|| RegistryError::UnknownConnection(conn_id.to_string()))?;
        write_guard(&connection.subscriptions, SOURCE, "remove_subscription").remove(key);
        debug!(conn_id, key, "Subscription removed");
        Ok(())
    }

    pub async fn broadcast_to_user(
        &self,
        user_id: &str,
        event: &str,
        payload: &Value,
    ) -> BroadcastReport {
        let targets: Vec<Arc<Connection>> = match self.by_user.get(user_id) {
            Some(owned) => owned
                .iter()
                .filter_map(|id| self.connections.get(id).map(|c| Arc::clone(c.value())))
                .collect(),
            None => Vec::new(),
        };
        self.deliver(targets, event, payload).await
    }

    pub async fn broadcast_to_subscription(
        &self,
        key: &str,
        event: &str,
        payload: &Value,
    ) -> BroadcastReport {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_subscribed(key))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.deliver(targets, event, payload).await
    }

    /// Emit to every target concurrently. No registry lock is held while
    /// sending, so a connection removed mid-flight just fails its own send.
    async fn deliver(
        &self,
        targets: Vec<Arc<Connection>>,
        event: &str,
        payload: &Value,
    ) -> BroadcastReport {
        if targets.is_empty() {
            return BroadcastReport::default();
        }
        let started = StdInstant::now();
        let outcomes = join_all(targets.iter().map(|connection| async move {
            (connection, connection.transport.emit(event, payload).await)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (connection, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    counter!(METRIC_BROADCAST_FAILED).increment(1);
                    warn!(
                        conn_id = %connection.id,
                        user_id = %connection.user_id,
                        event,
                        error = %err,
                        "Realtime delivery failed"
                    );
                }
            }
        }

        if let Some(monitor) = self.monitor.as_ref() {
            monitor.record(
                Category::Realtime,
                &format!("broadcast:{event}"),
                started.elapsed(),
                report.failed == 0,
                false,
            );
        }
        report
    }

    /// Drop connections idle for longer than `threshold`. Returns how many
    /// were removed.
    pub fn reap_idle(&self, threshold: Duration) -> usize {
        let now = Instant::now();
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for(now) > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        let reaped = idle
            .iter()
            .filter(|conn_id| self.remove(conn_id).is_some())
            .count();
        if reaped > 0 {
            info!(reaped, threshold_secs = threshold.as_secs(), "Reaped idle connections");
        }
        reaped
    }

    pub fn get_user_connections(&self, user_id: &str) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut infos: Vec<ConnectionInfo> = match self.by_user.get(user_id) {
            Some(owned) => owned
                .iter()
                .filter_map(|id| self.connections.get(id).map(|c| c.info(now)))
                .collect(),
            None => Vec::new(),
        };
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn stats(&self) -> RegistryStats {
        let subscriptions = self
            .connections
            .iter()
            .map(|entry| read_guard(&entry.value().subscriptions, SOURCE, "stats").len())
            .sum();
        RegistryStats {
            connections: self.connections.len(),
            users: self.by_user.len(),
            subscriptions,
            max_connections_per_user: self.max_per_user,
        }
    }

    /// Remove every connection; used on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter(|conn_id| self.remove(conn_id).is_some())
            .count()
    }
}
