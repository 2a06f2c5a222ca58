//! Change-feed subscriptions.
//!
//! Each subscription walks `unsubscribed → subscribing → subscribed ⇄ erroring`.
//! A reader task per subscription forwards events into the shared
//! [`ChangePipeline`] channel. Failures never tear the manager down; they mark
//! the subscription `erroring` and reach the caller through `on_error`.
//! Retrying is the caller's call via [`ChangeFeedManager::resubscribe`].
//!
//! Several subscriptions may watch one table. Each still invalidates and runs
//! its own callback, but only one of them (an unfiltered one when available)
//! fans changes out to realtime clients.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::pipeline::{ChangeNotification, ChangePipeline, FeedMessage};
use crate::application::repos::{ChangeSource, ChangeStream};
use crate::cache::lock_guard;
use crate::domain::Filters;

const SOURCE: &str = "realtime::feed";

pub type CallbackError = Box<dyn StdError + Send + Sync>;
pub type ChangeCallback = Arc<dyn Fn(&ChangeNotification) -> Result<(), CallbackError> + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("failed to subscribe to `{table}`: {reason}")]
    Establish { table: String, reason: String },
    #[error("change stream for `{table}` failed: {reason}")]
    Stream { table: String, reason: String },
    #[error("change callback for `{table}` failed: {reason}")]
    Callback { table: String, reason: String },
    #[error("unknown subscription `{0}`")]
    UnknownSubscription(SubscriptionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Erroring,
}

impl SubscriptionState {
    fn as_u8(self) -> u8 {
        match self {
            SubscriptionState::Unsubscribed => 0,
            SubscriptionState::Subscribing => 1,
            SubscriptionState::Subscribed => 2,
            SubscriptionState::Erroring => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SubscriptionState::Subscribing,
            2 => SubscriptionState::Subscribed,
            3 => SubscriptionState::Erroring,
            _ => SubscriptionState::Unsubscribed,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn get(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, next: SubscriptionState) {
        self.0.store(next.as_u8(), Ordering::Release);
    }
}

/// Caller-supplied hooks for one subscription.
#[derive(Clone)]
pub struct SubscriptionHandlers {
    pub callback: ChangeCallback,
    pub on_error: ErrorHook,
}

impl SubscriptionHandlers {
    pub fn new<C, E>(callback: C, on_error: E) -> Self
    where
        C: Fn(&ChangeNotification) -> Result<(), CallbackError> + Send + Sync + 'static,
        E: Fn(&SubscriptionError) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            on_error: Arc::new(on_error),
        }
    }

    /// Handlers that only drive invalidation and fan-out.
    pub fn silent() -> Self {
        Self::new(|_| Ok(()), |_| {})
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub table: String,
    pub filter: String,
    pub state: SubscriptionState,
    pub broadcasting: bool,
}

struct Subscription {
    table: String,
    filters: Filters,
    handlers: SubscriptionHandlers,
    state: SharedState,
    reader: Option<JoinHandle<()>>,
}

pub struct ChangeFeedManager {
    source: Arc<dyn ChangeSource>,
    tx: mpsc::Sender<FeedMessage>,
    subscriptions: DashMap<SubscriptionId, Subscription>,
    /// Table -> the subscription whose events fan out to realtime clients.
    broadcasters: Arc<DashMap<String, SubscriptionId>>,
    pipeline_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChangeFeedManager {
    /// Start the pipeline worker and return a manager feeding it.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(source: Arc<dyn ChangeSource>, pipeline: Arc<ChangePipeline>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let pipeline_task = tokio::spawn(pipeline.run(rx));
        Self {
            source,
            tx,
            subscriptions: DashMap::new(),
            broadcasters: Arc::new(DashMap::new()),
            pipeline_task: std::sync::Mutex::new(Some(pipeline_task)),
        }
    }

    /// Register a subscription and try to establish it.
    ///
    /// Always returns an id. If the feed refuses the subscription it is left
    /// `erroring` and `on_error` has already been called.
    pub async fn subscribe(
        &self,
        table: &str,
        filters: Filters,
        handlers: SubscriptionHandlers,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let state = SharedState::default();
        state.set(SubscriptionState::Subscribing);
        self.subscriptions.insert(
            id,
            Subscription {
                table: table.to_string(),
                filters,
                handlers,
                state,
                reader: None,
            },
        );
        self.elect_broadcaster(table);
        self.establish(id).await;
        id
    }

    /// Tear down the current stream, if any, and open a new one.
    pub async fn resubscribe(&self, id: SubscriptionId) -> Result<SubscriptionState, SubscriptionError> {
        {
            let mut entry = self
                .subscriptions
                .get_mut(&id)
                .ok_or(SubscriptionError::UnknownSubscription(id))?;
            if let Some(reader) = entry.reader.take() {
                reader.abort();
            }
            entry.state.set(SubscriptionState::Subscribing);
        }
        self.establish(id).await;
        Ok(self.state(id))
    }

    /// Drop the subscription and its feed handle.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
        let (_, subscription) = self
            .subscriptions
            .remove(&id)
            .ok_or(SubscriptionError::UnknownSubscription(id))?;
        subscription.state.set(SubscriptionState::Unsubscribed);
        if let Some(reader) = subscription.reader {
            reader.abort();
        }
        if self.is_broadcaster(&subscription.table, id) {
            self.elect_broadcaster(&subscription.table);
        }
        info!(subscription = %id, table = %subscription.table, "Change subscription removed");
        Ok(())
    }

    /// State of `id`; unknown ids read as `unsubscribed`.
    pub fn state(&self, id: SubscriptionId) -> SubscriptionState {
        self.subscriptions
            .get(&id)
            .map_or(SubscriptionState::Unsubscribed, |entry| entry.state.get())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .subscriptions
            .iter()
            .map(|entry| SubscriptionInfo {
                id: *entry.key(),
                table: entry.table.clone(),
                filter: entry.filters.to_feed_filter(),
                state: entry.state.get(),
                broadcasting: self.is_broadcaster(&entry.table, *entry.key()),
            })
            .collect();
        infos.sort_by(|a, b| a.table.cmp(&b.table).then(a.id.cmp(&b.id)));
        infos
    }

    /// Unsubscribe everything and stop the pipeline worker.
    pub fn shutdown(&self) {
        let ids: Vec<SubscriptionId> = self.subscriptions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let _ = self.unsubscribe(id);
        }
        if let Some(task) = lock_guard(&self.pipeline_task, SOURCE, "shutdown").take() {
            task.abort();
        }
    }

    fn is_broadcaster(&self, table: &str, id: SubscriptionId) -> bool {
        self.broadcasters
            .get(table)
            .is_some_and(|broadcaster| *broadcaster == id)
    }

    /// Pick the subscription that fans out changes of `table`. Unfiltered
    /// subscriptions are preferred; otherwise a live current pick is kept.
    fn elect_broadcaster(&self, table: &str) {
        let current = self.broadcasters.get(table).map(|broadcaster| *broadcaster);
        let candidates: Vec<(SubscriptionId, bool)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.table == table)
            .map(|entry| (*entry.key(), entry.filters.is_empty()))
            .collect();

        let kept = current.and_then(|id| candidates.iter().find(|(candidate, _)| *candidate == id));
        let unfiltered = candidates.iter().find(|(_, unfiltered)| *unfiltered);
        let elected = match (kept, unfiltered) {
            (Some(&(id, true)), _) => Some(id),
            (_, Some(&(id, _))) => Some(id),
            (Some(&(id, false)), None) => Some(id),
            (None, None) => candidates.first().map(|(id, _)| *id),
        };

        match elected {
            Some(id) => {
                self.broadcasters.insert(table.to_string(), id);
            }
            None => {
                self.broadcasters.remove(table);
            }
        }
    }

    async fn establish(&self, id: SubscriptionId) {
        let Some((table, filters, handlers, state)) = self.subscriptions.get(&id).map(|entry| {
            (
                entry.table.clone(),
                entry.filters.clone(),
                entry.handlers.clone(),
                entry.state.clone(),
            )
        }) else {
            return;
        };

        match self.source.subscribe(&table, &filters).await {
            Ok(stream) => {
                state.set(SubscriptionState::Subscribed);
                let reader = tokio::spawn(read_stream(
                    id,
                    table.clone(),
                    stream,
                    handlers,
                    state,
                    Arc::clone(&self.broadcasters),
                    self.tx.clone(),
                ));
                match self.subscriptions.get_mut(&id) {
                    Some(mut entry) => entry.reader = Some(reader),
                    None => reader.abort(),
                }
                info!(
                    subscription = %id,
                    table = %table,
                    filter = %filters.to_feed_filter(),
                    "Change subscription established"
                );
            }
            Err(err) => {
                state.set(SubscriptionState::Erroring);
                let failure = SubscriptionError::Establish {
                    table,
                    reason: err.to_string(),
                };
                warn!(subscription = %id, error = %failure, "Change subscription failed");
                (handlers.on_error)(&failure);
            }
        }
    }
}

impl Drop for ChangeFeedManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn read_stream(
    id: SubscriptionId,
    table: String,
    mut stream: ChangeStream,
    handlers: SubscriptionHandlers,
    state: SharedState,
    broadcasters: Arc<DashMap<String, SubscriptionId>>,
    tx: mpsc::Sender<FeedMessage>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                state.set(SubscriptionState::Subscribed);
                let fan_out = broadcasters
                    .get(&table)
                    .is_some_and(|broadcaster| *broadcaster == id);
                let message = FeedMessage {
                    subscription: id,
                    event,
                    handlers: handlers.clone(),
                    fan_out,
                };
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                state.set(SubscriptionState::Erroring);
                let failure = SubscriptionError::Stream {
                    table: table.clone(),
                    reason: err.to_string(),
                };
                warn!(subscription = %id, error = %failure, "Change stream error");
                (handlers.on_error)(&failure);
            }
        }
    }

    if state.get() != SubscriptionState::Unsubscribed {
        state.set(SubscriptionState::Erroring);
        let failure = SubscriptionError::Stream {
            table,
            reason: "change stream ended".to_string(),
        };
        warn!(subscription = %id, error = %failure, "Change stream closed");
        (handlers.on_error)(&failure);
    }
}
