//! Health rating and recommendation rules.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{Category, CategorySummary, Thresholds};

/// Reads required before a low hit rate is worth reporting.
const MIN_CACHE_READS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthRating {
    Excellent,
    Good,
    Warning,
    Critical,
}

impl HealthRating {
    /// Rate from the overall error and slow fractions (0.0..=1.0).
    pub fn from_rates(error_rate: f64, slow_rate: f64) -> Self {
        if error_rate >= 0.10 || slow_rate >= 0.30 {
            HealthRating::Critical
        } else if error_rate >= 0.05 || slow_rate >= 0.15 {
            HealthRating::Warning
        } else if error_rate >= 0.01 || slow_rate >= 0.05 {
            HealthRating::Good
        } else {
            HealthRating::Excellent
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthRating::Excellent => "excellent",
            HealthRating::Good => "good",
            HealthRating::Warning => "warning",
            HealthRating::Critical => "critical",
        }
    }
}

/// Cache read counters fed into the rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheReads {
    pub hits: u64,
    pub misses: u64,
}

impl CacheReads {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

pub(crate) fn recommendations(
    summaries: &BTreeMap<Category, CategorySummary>,
    thresholds: &Thresholds,
    cache: Option<CacheReads>,
) -> Vec<String> {
    let mut advice = Vec::new();

    if let Some(reads) = cache.filter(|reads| reads.total() >= MIN_CACHE_READS) {
        if reads.hit_rate() < 0.5 {
            advice.push(format!(
                "Cache hit rate is {:.1}%; increase TTL for frequently read data",
                reads.hit_rate() * 100.0
            ));
        }
    }

    if let Some(db) = summaries.get(&Category::Database) {
        if db.slow_rate > 0.10 {
            advice.push(format!(
                "{:.1}% of database operations exceed {}ms; add indexes or narrow selected columns",
                db.slow_rate * 100.0,
                thresholds.slow_for(Category::Database).as_millis()
            ));
        }
    }

    if let Some(api) = summaries.get(&Category::Api) {
        if api.slow_rate > 0.10 {
            advice.push(
                "API responses are slow; cache hot endpoints or paginate large listings".to_string(),
            );
        }
    }

    if let Some(realtime) = summaries.get(&Category::Realtime) {
        let threshold_ms = thresholds.slow_for(Category::Realtime).as_secs_f64() * 1000.0;
        if realtime.count > 0 && realtime.average_ms > threshold_ms {
            advice.push(format!(
                "Realtime fan-out averages {:.0}ms; reduce subscriptions per connection",
                realtime.average_ms
            ));
        }
    }

    for (category, summary) in summaries {
        if summary.error_rate > 0.05 {
            advice.push(format!(
                "{} error rate is {:.1}%; inspect recent operation_failed alerts",
                category.as_str(),
                summary.error_rate * 100.0
            ));
        }
    }

    advice
}
