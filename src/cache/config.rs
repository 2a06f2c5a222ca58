//! Cache configuration.
//!
//! TTL tiers per data category plus the knobs of the query/pagination layers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 250;
const DEFAULT_MAX_PAGE_SIZE: u64 = 100;
const DEFAULT_RECORD_TTL_SECS: u64 = 60;

const DEFAULT_TTL_USER_DATA_SECS: u64 = 300;
const DEFAULT_TTL_CHATS_SECS: u64 = 600;
const DEFAULT_TTL_MESSAGES_SECS: u64 = 120;
const DEFAULT_TTL_CAMPAIGNS_SECS: u64 = 900;
const DEFAULT_TTL_CONTACTS_SECS: u64 = 1800;
const DEFAULT_TTL_ANALYTICS_SECS: u64 = 3600;
const DEFAULT_TTL_FALLBACK_SECS: u64 = 300;

/// Data category that selects a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    UserData,
    Chats,
    Messages,
    Campaigns,
    Contacts,
    Analytics,
    Default,
}

impl TtlTier {
    /// Pick the tier for a table name.
    pub fn for_table(table: &str) -> Self {
        match table {
            "users" | "accounts" | "profiles" | "user_settings" => TtlTier::UserData,
            "chats" | "conversations" => TtlTier::Chats,
            "messages" | "chat_messages" => TtlTier::Messages,
            "campaigns" | "campaign_steps" => TtlTier::Campaigns,
            "contacts" | "contact_lists" => TtlTier::Contacts,
            "analytics" | "events" | "stats" => TtlTier::Analytics,
            _ => TtlTier::Default,
        }
    }
}

/// Seconds to live for each [`TtlTier`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TtlTiers {
    pub user_data: u64,
    pub chats: u64,
    pub messages: u64,
    pub campaigns: u64,
    pub contacts: u64,
    pub analytics: u64,
    pub default: u64,
}

impl Default for TtlTiers {
    fn default() -> Self {
        Self {
            user_data: DEFAULT_TTL_USER_DATA_SECS,
            chats: DEFAULT_TTL_CHATS_SECS,
            messages: DEFAULT_TTL_MESSAGES_SECS,
            campaigns: DEFAULT_TTL_CAMPAIGNS_SECS,
            contacts: DEFAULT_TTL_CONTACTS_SECS,
            analytics: DEFAULT_TTL_ANALYTICS_SECS,
            default: DEFAULT_TTL_FALLBACK_SECS,
        }
    }
}

impl TtlTiers {
    pub fn seconds(&self, tier: TtlTier) -> u64 {
        let secs = match tier {
            TtlTier::UserData => self.user_data,
            TtlTier::Chats => self.chats,
            TtlTier::Messages => self.messages,
            TtlTier::Campaigns => self.campaigns,
            TtlTier::Contacts => self.contacts,
            TtlTier::Analytics => self.analytics,
            TtlTier::Default => self.default,
        };
        secs.max(1)
    }

    pub fn ttl(&self, tier: TtlTier) -> Duration {
        Duration::from_secs(self.seconds(tier))
    }
}

/// Cache configuration resolved from the `[cache]` settings section.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound for a single backing-store call before it counts as unavailable.
    pub operation_timeout: Duration,
    /// Largest page size the pagination engine will serve.
    pub max_page_size: u64,
    /// Collapse concurrent misses for the same key into one loader call.
    pub single_flight: bool,
    /// TTL of per-record entries written by the change feed.
    pub record_ttl: Duration,
    pub ttl: TtlTiers,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            single_flight: false,
            record_ttl: Duration::from_secs(DEFAULT_RECORD_TTL_SECS),
            ttl: TtlTiers::default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            operation_timeout: settings.operation_timeout,
            max_page_size: settings.max_page_size.get(),
            single_flight: settings.single_flight,
            record_ttl: settings.record_ttl,
            ttl: settings.ttl.clone(),
        }
    }
}

impl CacheConfig {
    /// TTL for list/query results of the given table.
    pub fn ttl_for_table(&self, table: &str) -> Duration {
        self.ttl.ttl(TtlTier::for_table(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.max_page_size, 100);
        assert!(!config.single_flight);
        assert_eq!(config.record_ttl, Duration::from_secs(60));
        assert_eq!(config.ttl.chats, 600);
    }

    #[test]
    fn tables_map_to_tiers() {
        assert_eq!(TtlTier::for_table("chats"), TtlTier::Chats);
        assert_eq!(TtlTier::for_table("accounts"), TtlTier::UserData);
        assert_eq!(TtlTier::for_table("invoices"), TtlTier::Default);

        let config = CacheConfig::default();
        assert_eq!(config.ttl_for_table("contacts"), Duration::from_secs(1800));
        assert_eq!(config.ttl_for_table("messages"), Duration::from_secs(120));
    }

    #[test]
    fn zero_ttl_clamps_to_one_second() {
        let tiers = TtlTiers {
            chats: 0,
            ..Default::default()
        };
        assert_eq!(tiers.seconds(TtlTier::Chats), 1);
    }
}
