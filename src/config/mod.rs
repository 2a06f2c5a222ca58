//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{CliArgs, Command, DatabaseOverride, ServeArgs, ServeOverrides};

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::TtlTiers;
use crate::domain::filter::validate_identifier;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "datagate";
const ENV_PREFIX: &str = "DATAGATE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CHANGE_CHANNEL: &str = "datagate_changes";
const DEFAULT_CACHE_OPERATION_TIMEOUT_MS: u64 = 250;
const DEFAULT_CACHE_MAX_PAGE_SIZE: u64 = 100;
const DEFAULT_CACHE_RECORD_TTL_SECS: u64 = 60;
const DEFAULT_CACHE_PROBE_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_CONNECTIONS_PER_USER: u32 = 5;
const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 30 * 60;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_OUTBOUND_BUFFER: u32 = 64;
const DEFAULT_FEED_BUFFER: u32 = 256;
const DEFAULT_API_SLOW_MS: u64 = 1000;
const DEFAULT_DATABASE_SLOW_MS: u64 = 500;
const DEFAULT_REALTIME_SLOW_MS: u64 = 250;
const DEFAULT_FRONTEND_SLOW_MS: u64 = 3000;
const DEFAULT_SYSTEM_SLOW_MS: u64 = 1000;
const DEFAULT_ALERT_CAPACITY: u32 = 100;
const DEFAULT_SAMPLE_WINDOW: u32 = 1000;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub realtime: RealtimeSettings,
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// `None` runs the service without a relational store.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub change_channel: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// `None` disables caching; every lookup bypasses to the store.
    pub redis_url: Option<String>,
    pub operation_timeout: Duration,
    pub max_page_size: NonZeroU64,
    pub single_flight: bool,
    pub record_ttl: Duration,
    pub probe_interval: Duration,
    pub ttl: TtlTiers,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub max_connections_per_user: NonZeroU32,
    pub idle_threshold: Duration,
    pub reap_interval: Duration,
    pub outbound_buffer: NonZeroU32,
    pub feed_buffer: NonZeroU32,
    pub watch_tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub api_slow: Duration,
    pub database_slow: Duration,
    pub realtime_slow: Duration,
    pub frontend_slow: Duration,
    pub system_slow: Duration,
    pub alert_capacity: NonZeroU32,
    pub sample_window: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(database)) => raw.apply_database_override(database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    realtime: RawRealtimeSettings,
    monitor: RawMonitorSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(enabled) = overrides.cache_single_flight {
            self.cache.single_flight = Some(enabled);
        }
        if let Some(max) = overrides.realtime_max_connections_per_user {
            self.realtime.max_connections_per_user = Some(max);
        }
        if let Some(tables) = overrides.realtime_watch_tables.as_ref() {
            self.realtime.watch_tables = Some(tables.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            cache,
            realtime,
            monitor,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
            realtime: build_realtime_settings(realtime)?,
            monitor: build_monitor_settings(monitor)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    let change_channel =
        non_blank(database.change_channel).unwrap_or_else(|| DEFAULT_CHANGE_CHANNEL.to_string());
    validate_identifier(&change_channel)
        .map_err(|err| LoadError::invalid("database.change_channel", err.to_string()))?;

    Ok(DatabaseSettings {
        url,
        max_connections,
        change_channel,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let operation_timeout_ms = cache
        .operation_timeout_ms
        .unwrap_or(DEFAULT_CACHE_OPERATION_TIMEOUT_MS);
    if operation_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.operation_timeout_ms",
            "must be greater than zero",
        ));
    }

    let max_page_size = NonZeroU64::new(
        cache
            .max_page_size
            .unwrap_or(DEFAULT_CACHE_MAX_PAGE_SIZE),
    )
    .ok_or_else(|| LoadError::invalid("cache.max_page_size", "must be greater than zero"))?;

    Ok(CacheSettings {
        redis_url: non_blank(cache.redis_url),
        operation_timeout: Duration::from_millis(operation_timeout_ms),
        max_page_size,
        single_flight: cache.single_flight.unwrap_or(false),
        record_ttl: Duration::from_secs(
            positive_or_default(
                cache.record_ttl_seconds,
                DEFAULT_CACHE_RECORD_TTL_SECS,
                "cache.record_ttl_seconds",
            )?,
        ),
        probe_interval: Duration::from_secs(positive_or_default(
            cache.probe_interval_seconds,
            DEFAULT_CACHE_PROBE_INTERVAL_SECS,
            "cache.probe_interval_seconds",
        )?),
        ttl: cache.ttl,
    })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    let mut watch_tables: Vec<String> = Vec::new();
    for table in realtime
        .watch_tables
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|table| !table.is_empty())
    {
        if !watch_tables.iter().any(|seen| seen == table) {
            watch_tables.push(table.to_string());
        }
    }
    for table in &watch_tables {
        validate_identifier(table)
            .map_err(|err| LoadError::invalid("realtime.watch_tables", err.to_string()))?;
    }

    Ok(RealtimeSettings {
        max_connections_per_user: non_zero_u32(
            realtime
                .max_connections_per_user
                .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_USER)
                .into(),
            "realtime.max_connections_per_user",
        )?,
        idle_threshold: Duration::from_secs(positive_or_default(
            realtime.idle_threshold_seconds,
            DEFAULT_IDLE_THRESHOLD_SECS,
            "realtime.idle_threshold_seconds",
        )?),
        reap_interval: Duration::from_secs(positive_or_default(
            realtime.reap_interval_seconds,
            DEFAULT_REAP_INTERVAL_SECS,
            "realtime.reap_interval_seconds",
        )?),
        outbound_buffer: non_zero_u32(
            realtime
                .outbound_buffer
                .unwrap_or(DEFAULT_OUTBOUND_BUFFER)
                .into(),
            "realtime.outbound_buffer",
        )?,
        feed_buffer: non_zero_u32(
            realtime.feed_buffer.unwrap_or(DEFAULT_FEED_BUFFER).into(),
            "realtime.feed_buffer",
        )?,
        watch_tables,
    })
}

fn build_monitor_settings(monitor: RawMonitorSettings) -> Result<MonitorSettings, LoadError> {
    Ok(MonitorSettings {
        api_slow: Duration::from_millis(positive_or_default(
            monitor.api_slow_ms,
            DEFAULT_API_SLOW_MS,
            "monitor.api_slow_ms",
        )?),
        database_slow: Duration::from_millis(positive_or_default(
            monitor.database_slow_ms,
            DEFAULT_DATABASE_SLOW_MS,
            "monitor.database_slow_ms",
        )?),
        realtime_slow: Duration::from_millis(positive_or_default(
            monitor.realtime_slow_ms,
            DEFAULT_REALTIME_SLOW_MS,
            "monitor.realtime_slow_ms",
        )?),
        frontend_slow: Duration::from_millis(positive_or_default(
            monitor.frontend_slow_ms,
            DEFAULT_FRONTEND_SLOW_MS,
            "monitor.frontend_slow_ms",
        )?),
        system_slow: Duration::from_millis(positive_or_default(
            monitor.system_slow_ms,
            DEFAULT_SYSTEM_SLOW_MS,
            "monitor.system_slow_ms",
        )?),
        alert_capacity: non_zero_u32(
            monitor
                .alert_capacity
                .unwrap_or(DEFAULT_ALERT_CAPACITY)
                .into(),
            "monitor.alert_capacity",
        )?,
        sample_window: non_zero_u32(
            monitor.sample_window.unwrap_or(DEFAULT_SAMPLE_WINDOW).into(),
            "monitor.sample_window",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    change_channel: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    redis_url: Option<String>,
    operation_timeout_ms: Option<u64>,
    max_page_size: Option<u64>,
    single_flight: Option<bool>,
    record_ttl_seconds: Option<u64>,
    probe_interval_seconds: Option<u64>,
    ttl: TtlTiers,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    max_connections_per_user: Option<u32>,
    idle_threshold_seconds: Option<u64>,
    reap_interval_seconds: Option<u64>,
    outbound_buffer: Option<u32>,
    feed_buffer: Option<u32>,
    watch_tables: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMonitorSettings {
    api_slow_ms: Option<u64>,
    database_slow_ms: Option<u64>,
    realtime_slow_ms: Option<u64>,
    frontend_slow_ms: Option<u64>,
    system_slow_ms: Option<u64>,
    alert_capacity: Option<u32>,
    sample_window: Option<u32>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Positive integer setting, falling back to `default` when unset.
fn positive_or_default(value: Option<u64>, default: u64, key: &'static str) -> Result<u64, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        value => Ok(value),
    }
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
