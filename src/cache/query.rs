//! Read-through query cache.
//!
//! Look up a key; on a hit return the stored value, otherwise run the loader,
//! store its result and return it. Cache failures never fail the read, a
//! failed loader never poisons the cache, and a value whose key was
//! invalidated while it loaded is returned but not stored.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use super::store::{CacheStore, Lookup};

/// A value together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub from_cache: bool,
}

impl<T> Cached<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            from_cache: self.from_cache,
        }
    }
}

pub struct QueryCache {
    store: Arc<CacheStore>,
    /// Per-key gates for collapsing concurrent misses. `None` when disabled.
    inflight: Option<DashMap<String, Arc<Mutex<()>>>>,
}

impl QueryCache {
    pub fn new(store: Arc<CacheStore>, single_flight: bool) -> Self {
        Self {
            store,
            inflight: single_flight.then(DashMap::new),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn single_flight(&self) -> bool {
        self.inflight.is_some()
    }

    /// Return the cached value for `key`, or load, store and return it.
    ///
    /// Loader errors propagate unchanged and nothing is written.
    pub async fn cached<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Lookup::Hit(value) = self.store.get::<T>(key).await {
            return Ok(Cached {
                value,
                from_cache: true,
            });
        }

        let Some(inflight) = self.inflight.as_ref() else {
            return self.load_and_store(key, ttl, loader).await;
        };

        let gate = inflight.entry(key.to_string()).or_default().clone();
        let result = {
            let _turn = gate.lock().await;
            // A concurrent caller may have filled the key while we waited.
            match self.store.get::<T>(key).await {
                Lookup::Hit(value) => Ok(Cached {
                    value,
                    from_cache: true,
                }),
                Lookup::Miss | Lookup::Bypassed => self.load_and_store(key, ttl, loader).await,
            }
        };
        drop(gate);
        inflight.remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn load_and_store<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.store.generation(key);
        let value = loader().await?;
        if self.store.generation(key) != generation {
            debug!(key, "Skipped caching value loaded across an invalidation");
            return Ok(Cached {
                value,
                from_cache: false,
            });
        }
        match self.store.set(key, &value, ttl).await {
            Err(err) => debug!(key, error = %err, "Skipped caching loaded value"),
            // Invalidated while the write was in flight.
            Ok(()) if self.store.generation(key) != generation => {
                if let Err(err) = self.store.delete(key).await {
                    debug!(key, error = %err, "Failed to drop value stored across an invalidation");
                }
            }
            Ok(()) => {}
        }
        Ok(Cached {
            value,
            from_cache: false,
        })
    }
}
