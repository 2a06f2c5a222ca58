//! Backing-store abstraction for the shared cache.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Failure talking to the backing store.
///
/// Callers never see these from reads: the store degrades them into a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable")]
    Unavailable,
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache payload could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether the error means the backend should be treated as disconnected.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, CacheError::Unavailable | CacheError::Timeout(_))
    }
}

/// Observed connectivity of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
}

impl Connectivity {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Connectivity::Disconnected => 0,
            Connectivity::Connecting => 1,
            Connectivity::Connected => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            2 => Connectivity::Connected,
            1 => Connectivity::Connecting,
            _ => Connectivity::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Connectivity::Disconnected => "disconnected",
            Connectivity::Connecting => "connecting",
            Connectivity::Connected => "connected",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared key-value store with TTL and glob deletion.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Remove a single key, returning how many keys were removed.
    async fn delete(&self, key: &str) -> Result<u64, CacheError>;

    /// Remove every key matching a glob pattern (`*` and `?` wildcards).
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Glob match with `*` (any run) and `?` (single character), as used by
/// Redis `SCAN MATCH`.
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while k < key.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == key[k]) {
            p += 1;
            k += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = k;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            resume += 1;
            k = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_prefix_and_infix() {
        assert!(glob_matches("query:chats:*", "query:chats:eyJ9"));
        assert!(!glob_matches("query:chats:*", "query:chat:eyJ9"));
        assert!(!glob_matches("query:chats:*", "pagination:chats:eyJ9"));
        assert!(glob_matches("stats:*:daily", "stats:chats:daily"));
        assert!(glob_matches("*", "anything"));
    }

    #[test]
    fn glob_single_char() {
        assert!(glob_matches("record:chats:?", "record:chats:7"));
        assert!(!glob_matches("record:chats:?", "record:chats:77"));
    }

    #[test]
    fn glob_exact() {
        assert!(glob_matches("dashboard:main", "dashboard:main"));
        assert!(!glob_matches("dashboard:main", "dashboard:main2"));
    }

    #[test]
    fn connectivity_round_trips_through_u8() {
        for state in [
            Connectivity::Disconnected,
            Connectivity::Connecting,
            Connectivity::Connected,
        ] {
            assert_eq!(Connectivity::from_u8(state.as_u8()), state);
        }
    }
}
