//! Redis cache backend.
//!
//! The connection is opened lazily on first use and retried on every call
//! until it succeeds, so a server that is down at boot can still be picked up
//! by the store's probe loop. Every call is bounded by the configured
//! operation timeout; a timeout is reported like any other connectivity
//! failure so the store can degrade.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{CacheBackend, CacheError};

const SCAN_BATCH: usize = 100;
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RedisBackend {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connected", &self.conn.initialized())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisBackend {
    /// Parse `url` without connecting. Only a malformed URL fails here.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout,
        })
    }

    /// The managed connection, opening it if no attempt has succeeded yet.
    /// Once open, the connection manager reconnects on its own after a drop.
    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let connect_timeout = self.timeout.max(MIN_CONNECT_TIMEOUT);
        self.conn
            .get_or_try_init(|| async {
                let conn = tokio::time::timeout(
                    connect_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                .map_err(|_| CacheError::Timeout(connect_timeout))?
                .map_err(map_redis_error)?;
                info!("Redis connection established");
                Ok::<_, CacheError>(conn)
            })
            .await
            .cloned()
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(CacheError::Timeout(self.timeout)),
        }
    }
}

fn map_redis_error(err: redis::RedisError) -> CacheError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        CacheError::Unavailable
    } else {
        CacheError::Backend(err.to_string())
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        self.bounded(async move {
            let value: Option<Vec<u8>> = conn.get(key).await?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        self.bounded(async move {
            let _: () = conn.set_ex(key, value, seconds).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        self.bounded(async move {
            let removed: u64 = conn.del(key).await?;
            Ok(removed)
        })
        .await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut cursor = 0_u64;
        let mut removed = 0_u64;
        loop {
            let mut conn = self.connection().await?;
            let (next, keys): (u64, Vec<String>) = self
                .bounded(async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let mut conn = self.connection().await?;
                let batch: u64 = self
                    .bounded(async move { conn.del(keys).await })
                    .await?;
                removed += batch;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        debug!(pattern, removed, "Deleted keys by pattern");
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        self.bounded(async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
