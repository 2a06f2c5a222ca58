use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "datagate_cache_hit_total",
            Unit::Count,
            "Cache reads answered from the backing store."
        );
        describe_counter!(
            "datagate_cache_miss_total",
            Unit::Count,
            "Cache reads that found nothing or bypassed an unavailable store."
        );
        describe_counter!(
            "datagate_cache_set_total",
            Unit::Count,
            "Cache writes attempted."
        );
        describe_counter!(
            "datagate_cache_delete_total",
            Unit::Count,
            "Cache key and pattern deletions attempted."
        );
        describe_counter!(
            "datagate_broadcast_failed_total",
            Unit::Count,
            "Realtime deliveries that failed on a single connection."
        );
        describe_gauge!(
            "datagate_realtime_connections",
            Unit::Count,
            "Currently registered realtime connections."
        );
        describe_histogram!(
            "datagate_feed_event_ms",
            Unit::Milliseconds,
            "Change-feed pipeline latency per event in milliseconds."
        );
        describe_histogram!(
            "datagate_operation_ms",
            Unit::Milliseconds,
            "Monitored operation latency in milliseconds."
        );
    });
}
