//! Change-event pipeline.
//!
//! Feed readers push [`FeedMessage`]s into a channel; one worker drains it and
//! runs every event through the same fixed stages: cache invalidation, the
//! subscriber's callback, then fan-out to subscribed connections. A failure in
//! one stage is reported and the next stage still runs. Fan-out only happens
//! for messages flagged `fan_out`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connections::{BroadcastReport, ConnectionRegistry};
use super::feed::{SubscriptionError, SubscriptionHandlers, SubscriptionId};
use crate::application::monitor::{Category, MetricsCollector};
use crate::cache::{CacheStore, InvalidationOutcome, InvalidationPlan};
use crate::domain::{ChangeEvent, ChangeKind, Record};

const METRIC_FEED_EVENT_MS: &str = "datagate_feed_event_ms";

/// Event name used when pushing table changes to realtime clients.
pub const CHANGE_EVENT: &str = "change";

/// What a subscriber's callback receives for each change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub event_type: ChangeKind,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub table: String,
}

impl From<&ChangeEvent> for ChangeNotification {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            event_type: event.event_type,
            before: event.before.clone(),
            after: event.after.clone(),
            table: event.table.clone(),
        }
    }
}

/// One change on its way through the pipeline.
pub struct FeedMessage {
    pub subscription: SubscriptionId,
    pub event: ChangeEvent,
    pub handlers: SubscriptionHandlers,
    /// Whether this copy of the change is pushed to realtime clients. Only
    /// one subscription per table fans out, so clients see each change once.
    pub fan_out: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub invalidation: InvalidationOutcome,
    pub callback_failed: bool,
    pub broadcast: BroadcastReport,
}

pub struct ChangePipeline {
    cache: Arc<CacheStore>,
    record_ttl: Duration,
    registry: Option<Arc<ConnectionRegistry>>,
    monitor: Option<Arc<MetricsCollector>>,
}

impl ChangePipeline {
    pub fn new(cache: Arc<CacheStore>, record_ttl: Duration) -> Self {
        Self {
            cache,
            record_ttl,
            registry: None,
            monitor: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<MetricsCollector>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[instrument(
        skip_all,
        fields(
            subscription = %message.subscription,
            table = %message.event.table,
            kind = message.event.event_type.as_str()
        )
    )]
    pub async fn process(&self, message: FeedMessage) -> PipelineOutcome {
        let started = Instant::now();
        let FeedMessage {
            event,
            handlers,
            fan_out,
            ..
        } = message;
        let mut outcome = PipelineOutcome::default();

        let plan = InvalidationPlan::for_change(&event);
        debug!(%plan, "Applying change invalidation");
        outcome.invalidation = plan.apply(&self.cache, self.record_ttl).await;

        let notification = ChangeNotification::from(&event);
        if let Err(err) = (handlers.callback)(&notification) {
            outcome.callback_failed = true;
            let failure = SubscriptionError::Callback {
                table: event.table.clone(),
                reason: err.to_string(),
            };
            warn!(error = %failure, "Change callback failed");
            (handlers.on_error)(&failure);
        }

        if let Some(registry) = self.registry.as_ref().filter(|_| fan_out) {
            match serde_json::to_value(&notification) {
                Ok(payload) => {
                    outcome.broadcast = registry
                        .broadcast_to_subscription(&event.table, CHANGE_EVENT, &payload)
                        .await;
                }
                Err(err) => warn!(error = %err, "Failed to encode change notification"),
            }
        }

        let elapsed = started.elapsed();
        histogram!(METRIC_FEED_EVENT_MS, "table" => event.table.clone())
            .record(elapsed.as_secs_f64() * 1000.0);
        if let Some(monitor) = self.monitor.as_ref() {
            monitor.record(
                Category::Realtime,
                &format!("change:{}", event.table),
                elapsed,
                outcome.invalidation.failures == 0 && !outcome.callback_failed,
                false,
            );
        }
        outcome
    }

    /// Drain `rx` until every sender is gone.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<FeedMessage>) {
        info!("Change pipeline started");
        while let Some(message) = rx.recv().await {
            self.process(message).await;
        }
        info!("Change pipeline stopped");
    }
}
