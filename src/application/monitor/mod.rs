//! Operation metrics, alerts and health.
//!
//! Every hop through the layer records one sample here: category, duration,
//! success and whether the value came from the cache. Totals are kept per
//! category; raw samples and alerts live in bounded buffers.

mod alerts;
mod health;

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::histogram;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::warn;

pub use alerts::{Alert, AlertKind, AlertLog, Severity};
pub use health::{CacheReads, HealthRating};

use crate::cache::{CacheStats, lock_guard};

const SOURCE: &str = "application::monitor";
const METRIC_OPERATION_MS: &str = "datagate_operation_ms";

const DEFAULT_ALERT_CAPACITY: usize = 100;
const DEFAULT_SAMPLE_WINDOW: usize = 1000;
const REPORT_ALERT_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Api,
    Database,
    Realtime,
    Frontend,
    System,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Api,
        Category::Database,
        Category::Realtime,
        Category::Frontend,
        Category::System,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Database => "database",
            Category::Realtime => "realtime",
            Category::Frontend => "frontend",
            Category::System => "system",
        }
    }
}

/// Slow-operation thresholds per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    pub api: Duration,
    pub database: Duration,
    pub realtime: Duration,
    pub frontend: Duration,
    pub system: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            api: Duration::from_millis(1000),
            database: Duration::from_millis(500),
            realtime: Duration::from_millis(250),
            frontend: Duration::from_millis(3000),
            system: Duration::from_millis(1000),
        }
    }
}

impl Thresholds {
    pub fn slow_for(&self, category: Category) -> Duration {
        match category {
            Category::Api => self.api,
            Category::Database => self.database,
            Category::Realtime => self.realtime,
            Category::Frontend => self.frontend,
            Category::System => self.system,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub thresholds: Thresholds,
    pub alert_capacity: usize,
    pub sample_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

impl From<&crate::config::MonitorSettings> for MonitorConfig {
    fn from(settings: &crate::config::MonitorSettings) -> Self {
        Self {
            thresholds: Thresholds {
                api: settings.api_slow,
                database: settings.database_slow,
                realtime: settings.realtime_slow,
                frontend: settings.frontend_slow,
                system: settings.system_slow,
            },
            alert_capacity: settings.alert_capacity.get() as usize,
            sample_window: settings.sample_window.get() as usize,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub category: Category,
    pub name: String,
    pub duration_ms: f64,
    pub success: bool,
    pub from_cache: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default)]
struct CategoryTotals {
    count: u64,
    total_ms: f64,
    max_ms: f64,
    slow: u64,
    errors: u64,
    cache_hits: u64,
}

/// Aggregates for one category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub count: u64,
    pub total_time_ms: f64,
    pub average_ms: f64,
    pub max_ms: f64,
    pub slow_count: u64,
    pub error_count: u64,
    pub cache_hits: u64,
    pub error_rate: f64,
    pub slow_rate: f64,
    pub cache_hit_rate: f64,
}

impl From<CategoryTotals> for CategorySummary {
    fn from(totals: CategoryTotals) -> Self {
        let ratio = |part: u64| {
            if totals.count == 0 {
                0.0
            } else {
                part as f64 / totals.count as f64
            }
        };
        Self {
            count: totals.count,
            total_time_ms: totals.total_ms,
            average_ms: if totals.count == 0 {
                0.0
            } else {
                totals.total_ms / totals.count as f64
            },
            max_ms: totals.max_ms,
            slow_count: totals.slow,
            error_count: totals.errors,
            cache_hits: totals.cache_hits,
            error_rate: ratio(totals.errors),
            slow_rate: ratio(totals.slow),
            cache_hit_rate: ratio(totals.cache_hits),
        }
    }
}

/// Operational snapshot served by `/api/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub health: HealthRating,
    pub categories: BTreeMap<Category, CategorySummary>,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

struct MonitorState {
    totals: BTreeMap<Category, CategoryTotals>,
    samples: VecDeque<MetricSample>,
    alerts: AlertLog,
}

pub struct MetricsCollector {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl MetricsCollector {
    pub fn new(config: MonitorConfig) -> Self {
        let alerts = AlertLog::new(config.alert_capacity);
        Self {
            state: Mutex::new(MonitorState {
                totals: BTreeMap::new(),
                samples: VecDeque::with_capacity(config.sample_window.min(1024)),
                alerts,
            }),
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record one operation.
    pub fn record(
        &self,
        category: Category,
        name: &str,
        duration: Duration,
        success: bool,
        from_cache: bool,
    ) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        let threshold = self.config.thresholds.slow_for(category);
        let slow = duration >= threshold;

        histogram!(
            METRIC_OPERATION_MS,
            "category" => category.as_str(),
            "outcome" => if success { "ok" } else { "error" }
        )
        .record(duration_ms);

        let now = OffsetDateTime::now_utc();
        let mut state = lock_guard(&self.state, SOURCE, "record");

        let totals = state.totals.entry(category).or_default();
        totals.count += 1;
        totals.total_ms += duration_ms;
        totals.max_ms = totals.max_ms.max(duration_ms);
        totals.slow += u64::from(slow);
        totals.errors += u64::from(!success);
        totals.cache_hits += u64::from(from_cache);

        if state.samples.len() >= self.config.sample_window.max(1) {
            state.samples.pop_front();
        }
        state.samples.push_back(MetricSample {
            category,
            name: name.to_string(),
            duration_ms,
            success,
            from_cache,
            timestamp: now,
        });

        if !success {
            state.alerts.push(Alert {
                category,
                kind: AlertKind::OperationFailed,
                data: json!({ "name": name, "durationMs": duration_ms }),
                severity: Severity::Critical,
                timestamp: now,
            });
        }
        if slow {
            let severity = if duration >= threshold * 2 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            state.alerts.push(Alert {
                category,
                kind: AlertKind::SlowOperation,
                data: json!({
                    "name": name,
                    "durationMs": duration_ms,
                    "thresholdMs": threshold.as_millis() as u64,
                }),
                severity,
                timestamp: now,
            });
        }
        drop(state);

        if slow || !success {
            warn!(
                category = category.as_str(),
                name,
                duration_ms,
                success,
                "Operation crossed monitoring threshold"
            );
        }
    }

    /// Run `fut`, recording its duration and whether it returned `Ok`.
    pub async fn time<T, E, Fut>(&self, category: Category, name: &str, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.record(category, name, started.elapsed(), result.is_ok(), false);
        result
    }

    pub fn summary(&self, category: Category) -> CategorySummary {
        let state = lock_guard(&self.state, SOURCE, "summary");
        state
            .totals
            .get(&category)
            .copied()
            .unwrap_or_default()
            .into()
    }

    pub fn summaries(&self) -> BTreeMap<Category, CategorySummary> {
        let state = lock_guard(&self.state, SOURCE, "summaries");
        state
            .totals
            .iter()
            .map(|(category, totals)| (*category, CategorySummary::from(*totals)))
            .collect()
    }

    /// Most recent alerts, newest first.
    pub fn alerts(&self, limit: usize) -> Vec<Alert> {
        lock_guard(&self.state, SOURCE, "alerts").alerts.recent(limit)
    }

    /// Most recent samples, newest first.
    pub fn recent_samples(&self, limit: usize) -> Vec<MetricSample> {
        let state = lock_guard(&self.state, SOURCE, "recent_samples");
        state.samples.iter().rev().take(limit).cloned().collect()
    }

    pub fn health(&self) -> HealthRating {
        let state = lock_guard(&self.state, SOURCE, "health");
        let (count, errors, slow) = state.totals.values().fold((0, 0, 0), |acc, totals| {
            (acc.0 + totals.count, acc.1 + totals.errors, acc.2 + totals.slow)
        });
        if count == 0 {
            return HealthRating::Excellent;
        }
        HealthRating::from_rates(errors as f64 / count as f64, slow as f64 / count as f64)
    }

    /// Human-readable advice. Cache reads come from the store counters when
    /// given, otherwise from database samples flagged `from_cache`.
    pub fn recommendations(&self, cache: Option<&CacheStats>) -> Vec<String> {
        let summaries = self.summaries();
        let reads = match cache {
            Some(stats) => Some(CacheReads {
                hits: stats.hits,
                misses: stats.misses,
            }),
            None => summaries.get(&Category::Database).map(|db| CacheReads {
                hits: db.cache_hits,
                misses: db.count - db.cache_hits,
            }),
        };
        health::recommendations(&summaries, &self.config.thresholds, reads)
    }

    pub fn report(&self, cache: Option<CacheStats>) -> MonitorReport {
        MonitorReport {
            generated_at: OffsetDateTime::now_utc(),
            health: self.health(),
            categories: self.summaries(),
            alerts: self.alerts(REPORT_ALERT_LIMIT),
            recommendations: self.recommendations(cache.as_ref()),
            cache,
        }
    }

    pub fn reset(&self) {
        let mut state = lock_guard(&self.state, SOURCE, "reset");
        state.totals.clear();
        state.samples.clear();
        state.alerts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(MonitorConfig {
            alert_capacity: 3,
            sample_window: 4,
            ..Default::default()
        })
    }

    #[test]
    fn totals_and_average() {
        let monitor = collector();
        monitor.record(Category::Database, "select:chats", Duration::from_millis(100), true, false);
        monitor.record(Category::Database, "select:chats", Duration::from_millis(300), true, true);

        let summary = monitor.summary(Category::Database);
        assert_eq!(summary.count, 2);
        assert!((summary.average_ms - 200.0).abs() < 1e-6);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.slow_count, 0);
        assert!(monitor.alerts(10).is_empty());
    }

    #[test]
    fn slow_and_failed_operations_raise_alerts() {
        let monitor = collector();
        monitor.record(Category::Database, "select:chats", Duration::from_millis(600), true, false);
        monitor.record(Category::Api, "GET /x", Duration::from_millis(2500), true, false);
        monitor.record(Category::Database, "insert:chats", Duration::from_millis(5), false, false);

        let alerts = monitor.alerts(10);
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].kind, AlertKind::OperationFailed);
        assert_eq!(alerts[1].severity, Severity::Critical);
        assert_eq!(alerts[2].severity, Severity::Warning);
        assert_eq!(alerts[2].category, Category::Database);
    }

    #[test]
    fn alert_buffer_and_sample_window_are_bounded() {
        let monitor = collector();
        for _ in 0..10 {
            monitor.record(Category::System, "tick", Duration::from_secs(2), false, false);
        }
        assert_eq!(monitor.alerts(100).len(), 3);
        assert_eq!(monitor.recent_samples(100).len(), 4);
        assert_eq!(monitor.summary(Category::System).count, 10);
    }

    #[test]
    fn health_degrades_with_errors() {
        let monitor = collector();
        assert_eq!(monitor.health(), HealthRating::Excellent);
        for n in 0..10 {
            monitor.record(Category::Api, "GET /", Duration::from_millis(10), n != 0, false);
        }
        assert_eq!(monitor.health(), HealthRating::Critical);
    }

    #[tokio::test]
    async fn time_records_outcome() {
        let monitor = collector();
        let ok: Result<u32, String> = monitor
            .time(Category::System, "job", async { Ok(1) })
            .await;
        assert_eq!(ok, Ok(1));
        let err: Result<u32, String> = monitor
            .time(Category::System, "job", async { Err("boom".to_string()) })
            .await;
        assert!(err.is_err());

        let summary = monitor.summary(Category::System);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.error_count, 1);
    }

    #[test]
    fn report_includes_recommendations() {
        let monitor = collector();
        for _ in 0..30 {
            monitor.record(Category::Database, "select:chats", Duration::from_millis(1), true, false);
        }
        let report = monitor.report(None);
        assert_eq!(report.health, HealthRating::Excellent);
        assert!(report
            .recommendations
            .iter()
            .any(|advice| advice.contains("increase TTL")));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["categories"]["database"]["count"].is_number());
    }

    #[test]
    fn reset_clears_everything() {
        let monitor = collector();
        monitor.record(Category::Api, "GET /", Duration::from_secs(5), false, false);
        monitor.reset();
        assert!(monitor.summaries().is_empty());
        assert!(monitor.alerts(10).is_empty());
    }
}
