//! Cacher configuration.
//!
//! Mirrors the `[cache]` section of the settings file.

use std::time::Duration;

use serde::Deserialize;

use super::trigger::MONITOR_PREFIX;

// Default values for cacher configuration
const DEFAULT_PERIOD_SECONDS: u64 = 30 * 60;
const DEFAULT_LOCK_TTL_MS: u64 = 4000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace of the cache family; first segment of every key.
    pub prefix: String,
    /// Lifetime of stored entries and of their metadata rows.
    pub period_seconds: u64,
    /// Lease of the population lock.
    pub lock_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: MONITOR_PREFIX.to_string(),
            period_seconds: DEFAULT_PERIOD_SECONDS,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            period_seconds: u64::from(settings.period_seconds.get()),
            lock_ttl_ms: u64::from(settings.lock_ttl_ms.get()),
        }
    }
}

impl CacheConfig {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Entry TTL, at least one second.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds.max(1))
    }

    /// Lock lease, at least one millisecond.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms.max(1))
    }
}
