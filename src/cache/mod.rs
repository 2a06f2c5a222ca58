//! Shared cache layer.
//!
//! - **CacheStore**: key/value access to Redis (or an in-process backend) that
//!   degrades to a bypass when the backend is missing or unreachable
//! - **QueryCache**: read-through caching of arbitrary loaders
//! - **PaginationEngine**: cached page-shaped results with metadata
//! - **InvalidationPlan**: the cache actions that follow a write or change
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! redis_url = "redis://127.0.0.1:6379"
//! operation_timeout_ms = 250
//! max_page_size = 100
//!
//! [cache.ttl]
//! chats = 600
//! messages = 120
//! ```

mod backend;
mod config;
pub mod keys;
mod lock;
mod memory;
mod pagination;
mod planner;
mod query;
mod redis;
mod store;

pub use backend::{CacheBackend, CacheError, Connectivity, glob_matches};
pub use config::{CacheConfig, TtlTier, TtlTiers};
pub(crate) use lock::{lock_guard, read_guard, write_guard};
pub use memory::MemoryBackend;
pub use pagination::{PageRequest, PageResult, PageSlice, PaginationEngine};
pub use planner::{InvalidationOutcome, InvalidationPlan, RecordAction};
pub use query::{Cached, QueryCache};
pub use self::redis::RedisBackend;
pub use store::{CacheStats, CacheStore, Lookup};
