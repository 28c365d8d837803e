//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr};

use apalis_cron::Schedule;
use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagcache";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_CACHE_PREFIX: &str = "monitor";
const DEFAULT_CACHE_PERIOD_SECONDS: u64 = 30 * 60;
const DEFAULT_CACHE_LOCK_TTL_MS: u64 = 4000;
const MIN_CACHE_LOCK_TTL_MS: u64 = 100;
pub(crate) const DEFAULT_REAPER_SCHEDULE: &str = "0 0 * * * *";

/// Command-line arguments for the tagcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "tagcache",
    version,
    about = "Tag-indexed cache maintenance: metadata reaper and manual invalidation"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the periodic metadata reaper until interrupted.
    Reaper(ReaperArgs),
    /// Delete expired metadata rows once and exit.
    Reap(ReapArgs),
    /// Evict cached entries matching tag predicates.
    Invalidate(InvalidateArgs),
    /// Apply database migrations.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ReaperArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the reaper cron expression (seconds field first).
    #[arg(long = "reaper-schedule", value_name = "CRON")]
    pub schedule: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ReapArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the cache store URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the cache family prefix.
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefix: Option<String>,

    /// Label of the cached function.
    #[arg(long = "label", value_name = "LABEL")]
    pub label: String,

    /// Tag every evicted entry must carry, as `name=value` (lists: `name=1,2`).
    #[arg(long = "all-of", value_name = "TAG")]
    pub all_of: Vec<String>,

    /// Tag of which an evicted entry must carry at least one, as `name=value`.
    #[arg(long = "any-of", value_name = "TAG")]
    pub any_of: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub reaper: ReaperSettings,
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
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Cache store server.
    pub url: Option<String>,
    /// Lock servers; the store server is used when empty.
    pub lock_urls: Vec<String>,
}

impl RedisSettings {
    /// Servers that take part in the lock quorum.
    pub fn lock_servers(&self) -> Vec<String> {
        if self.lock_urls.is_empty() {
            self.url.iter().cloned().collect()
        } else {
            self.lock_urls.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub prefix: String,
    pub period_seconds: NonZeroU32,
    pub lock_ttl_ms: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub schedule: String,
}

impl ReaperSettings {
    pub fn cron_schedule(&self) -> Result<Schedule, LoadError> {
        parse_schedule(&self.schedule)
    }
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("TAGCACHE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("redis.lock_urls")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Reaper(args)) => raw.apply_reaper_overrides(args),
        Some(Command::Reap(args)) => {
            raw.apply_logging_overrides(&args.logging);
            raw.apply_database_override(&args.database);
        }
        Some(Command::Invalidate(args)) => raw.apply_invalidate_overrides(args),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    redis: RawRedisSettings,
    cache: RawCacheSettings,
    reaper: RawReaperSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_reaper_overrides(&mut self, args: &ReaperArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_database_override(&args.database);
        if let Some(schedule) = args.schedule.as_ref() {
            self.reaper.schedule = Some(schedule.clone());
        }
    }

    fn apply_invalidate_overrides(&mut self, args: &InvalidateArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_database_override(&args.database);
        if let Some(url) = args.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(prefix) = args.prefix.as_ref() {
            self.cache.prefix = Some(prefix.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            redis,
            cache,
            reaper,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            redis: build_redis_settings(redis)?,
            cache: build_cache_settings(cache)?,
            reaper: build_reaper_settings(reaper)?,
        })
    }
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
    let max_connections = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);

    Ok(DatabaseSettings {
        url: non_blank(database.url),
        max_connections: non_zero_u32(max_connections.into(), "database.max_connections")?,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = non_blank(redis.url);
    let lock_urls: Vec<String> = redis
        .lock_urls
        .into_iter()
        .filter_map(|value| non_blank(Some(value)))
        .collect();

    for candidate in url.iter().chain(lock_urls.iter()) {
        if !candidate.starts_with("redis://") && !candidate.starts_with("rediss://") {
            return Err(LoadError::invalid(
                "redis.url",
                format!("`{candidate}` is not a redis:// or rediss:// URL"),
            ));
        }
    }

    Ok(RedisSettings { url, lock_urls })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let prefix = cache
        .prefix
        .unwrap_or_else(|| DEFAULT_CACHE_PREFIX.to_string());
    let prefix = prefix.trim().to_string();
    if prefix.is_empty() || prefix.contains('/') {
        return Err(LoadError::invalid(
            "cache.prefix",
            "must be non-empty and must not contain `/`",
        ));
    }

    let period_seconds = cache
        .period_seconds
        .unwrap_or(DEFAULT_CACHE_PERIOD_SECONDS);
    let lock_ttl_ms = cache.lock_ttl_ms.unwrap_or(DEFAULT_CACHE_LOCK_TTL_MS);
    if lock_ttl_ms < MIN_CACHE_LOCK_TTL_MS {
        return Err(LoadError::invalid(
            "cache.lock_ttl_ms",
            format!("must be at least {MIN_CACHE_LOCK_TTL_MS}"),
        ));
    }

    Ok(CacheSettings {
        prefix,
        period_seconds: non_zero_u32(period_seconds, "cache.period_seconds")?,
        lock_ttl_ms: non_zero_u32(lock_ttl_ms, "cache.lock_ttl_ms")?,
    })
}

fn build_reaper_settings(reaper: RawReaperSettings) -> Result<ReaperSettings, LoadError> {
    let schedule = reaper
        .schedule
        .unwrap_or_else(|| DEFAULT_REAPER_SCHEDULE.to_string());
    parse_schedule(&schedule)?;
    Ok(ReaperSettings { schedule })
}

fn parse_schedule(expression: &str) -> Result<Schedule, LoadError> {
    Schedule::from_str(expression).map_err(|err| {
        LoadError::invalid("reaper.schedule", format!("`{expression}`: {err}"))
    })
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
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
    lock_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    prefix: Option<String>,
    period_seconds: Option<u64>,
    lock_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawReaperSettings {
    schedule: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
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

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
