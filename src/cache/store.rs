//! Shared cache store with graceful degradation.
//!
//! Wraps an optional [`CacheBackend`]. When no backend is configured, or the
//! backend is not connected, reads report [`Lookup::Bypassed`] and writes
//! fail fast with [`CacheError::Unavailable`]; no caller ever waits on a
//! reconnect. Every call bumps exactly one of four counters.
//!
//! Pattern deletes also advance an invalidation generation for the literal
//! prefix of the pattern. Loaders compare [`CacheStore::generation`] before
//! and after a load so a value read before a write is never stored after the
//! write's invalidation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, CacheError, Connectivity};

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_CACHE_HIT: &str = "datagate_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "datagate_cache_miss_total";
pub(crate) const METRIC_CACHE_SET: &str = "datagate_cache_set_total";
pub(crate) const METRIC_CACHE_DELETE: &str = "datagate_cache_delete_total";

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// The store answered and the key is absent.
    Miss,
    /// The store is disabled or unreachable; treat as a miss.
    Bypassed,
}

impl<T> Lookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_hit(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Bypassed => None,
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub backend: Option<&'static str>,
    pub connectivity: Connectivity,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// `hits / (hits + misses)`, or 0 before the first read.
    pub hit_rate: f64,
}

pub struct CacheStore {
    backend: Option<Arc<dyn CacheBackend>>,
    state: AtomicU8,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    /// Pattern prefix -> number of pattern deletes issued under it.
    generations: DashMap<String, u64>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("connectivity", &self.connectivity())
            .finish()
    }
}

impl CacheStore {
    /// A store with no backend. Every read is bypassed.
    pub fn disabled() -> Self {
        Self::build(None, Connectivity::Disconnected)
    }

    /// A store whose backend still needs a successful [`probe`](Self::probe).
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::build(Some(backend), Connectivity::Connecting)
    }

    /// A store whose backend is known to be reachable, such as an
    /// in-process [`MemoryBackend`](super::memory::MemoryBackend).
    pub fn connected(backend: Arc<dyn CacheBackend>) -> Self {
        Self::build(Some(backend), Connectivity::Connected)
    }

    fn build(backend: Option<Arc<dyn CacheBackend>>, state: Connectivity) -> Self {
        Self {
            backend,
            state: AtomicU8::new(state.as_u8()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            generations: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn connectivity(&self) -> Connectivity {
        Connectivity::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Record a connectivity transition reported by the backend client.
    pub fn on_connectivity(&self, next: Connectivity) {
        let previous = Connectivity::from_u8(self.state.swap(next.as_u8(), Ordering::AcqRel));
        if previous == next {
            return;
        }
        match next {
            Connectivity::Disconnected => warn!(
                target = SOURCE,
                from = %previous,
                to = %next,
                "Cache backend disconnected; serving from the source of truth"
            ),
            Connectivity::Connecting | Connectivity::Connected => {
                info!(target = SOURCE, from = %previous, to = %next, "Cache connectivity changed")
            }
        }
    }

    /// Ping the backend and update connectivity from the outcome.
    pub async fn probe(&self) -> Connectivity {
        let Some(backend) = self.backend.as_ref() else {
            return Connectivity::Disconnected;
        };
        if self.connectivity() != Connectivity::Connected {
            self.on_connectivity(Connectivity::Connecting);
        }
        match backend.ping().await {
            Ok(()) => self.on_connectivity(Connectivity::Connected),
            Err(err) => {
                debug!(target = SOURCE, error = %err, "Cache probe failed");
                self.on_connectivity(Connectivity::Disconnected);
            }
        }
        self.connectivity()
    }

    fn usable(&self) -> Option<&Arc<dyn CacheBackend>> {
        match self.backend.as_ref() {
            Some(backend) if self.connectivity() == Connectivity::Connected => Some(backend),
            _ => None,
        }
    }

    fn record_failure(&self, op: &'static str, key: &str, err: &CacheError) {
        warn!(target = SOURCE, op, key, error = %err, "Cache operation failed");
        if err.is_connectivity() {
            self.on_connectivity(Connectivity::Disconnected);
        }
    }

    fn count_miss(&self, reason: &'static str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_MISS, "reason" => reason).increment(1);
    }

    /// Raw read.
    pub async fn get_raw(&self, key: &str) -> Lookup<Vec<u8>> {
        let Some(backend) = self.usable() else {
            self.count_miss("bypassed");
            return Lookup::Bypassed;
        };

        match backend.get(key).await {
            Ok(Some(bytes)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_HIT).increment(1);
                Lookup::Hit(bytes)
            }
            Ok(None) => {
                self.count_miss("absent");
                Lookup::Miss
            }
            Err(err) => {
                self.record_failure("get", key, &err);
                self.count_miss("bypassed");
                Lookup::Bypassed
            }
        }
    }

    /// Typed read. A payload that no longer decodes counts as a miss.
    pub async fn get<T>(&self, key: &str) -> Lookup<T>
    where
        T: DeserializeOwned,
    {
        match self.get_raw(key).await {
            Lookup::Hit(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Lookup::Hit(value),
                Err(err) => {
                    warn!(target = SOURCE, key, error = %err, "Discarding undecodable cache entry");
                    Lookup::Miss
                }
            },
            Lookup::Miss => Lookup::Miss,
            Lookup::Bypassed => Lookup::Bypassed,
        }
    }

    pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_SET).increment(1);

        let backend = self.usable().ok_or(CacheError::Unavailable)?;
        let payload = serde_json::to_vec(value)?;
        backend.set(key, &payload, ttl).await.inspect_err(|err| {
            self.record_failure("set", key, err);
        })
    }

    pub async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_DELETE, "kind" => "key").increment(1);

        let backend = self.usable().ok_or(CacheError::Unavailable)?;
        backend.delete(key).await.inspect_err(|err| {
            self.record_failure("delete", key, err);
        })
    }

    /// Invalidation generation of `key`. Moves forward whenever a pattern
    /// delete that could match `key` is issued, whether or not it succeeds.
    pub fn generation(&self, key: &str) -> u64 {
        self.generations
            .iter()
            .filter(|entry| key.starts_with(entry.key().as_str()))
            .map(|entry| *entry.value())
            .sum()
    }

    fn advance_generation(&self, pattern: &str) {
        let prefix = pattern
            .find(['*', '?'])
            .map_or(pattern, |wildcard| &pattern[..wildcard]);
        *self.generations.entry(prefix.to_string()).or_insert(0) += 1;
    }

    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        self.advance_generation(pattern);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_DELETE, "kind" => "pattern").increment(1);

        let backend = self.usable().ok_or(CacheError::Unavailable)?;
        backend.delete_pattern(pattern).await.inspect_err(|err| {
            self.record_failure("delete_pattern", pattern, err);
        })
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = hits + misses;
        CacheStats {
            enabled: self.is_enabled(),
            backend: self.backend.as_ref().map(|backend| backend.name()),
            connectivity: self.connectivity(),
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hit_rate: if reads == 0 {
                0.0
            } else {
                hits as f64 / reads as f64
            },
        }
    }
}
