//! Engine configuration.
//!
//! Loaded from a JSON file where every section and field is optional, then
//! overridden from `SYNCLINE_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::models::Collection;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub outbox: OutboxConfig,
    pub governor: GovernorConfig,
    pub delta: DeltaConfig,
    pub cache: CacheConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Items pulled per collection per drain round
    pub batch_size: usize,
    /// Failed attempts before an item becomes terminal
    pub max_retry_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Background drain interval
    pub drain_interval_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_retry_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            drain_interval_secs: 30,
        }
    }
}

impl OutboxConfig {
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub const fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Ceiling on concurrent in-flight remote calls
    pub max_concurrent: usize,
    pub request_timeout_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            request_timeout_ms: 15_000,
        }
    }
}

impl GovernorConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Where the delta checkpoint moves after a successful pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    /// Start time of the pull request; cannot miss records written mid-fetch
    #[default]
    RequestStart,
    /// Largest `updated_at` among fetched records (falls back to request start
    /// when nothing was fetched)
    MaxRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Scheduled pull interval
    pub interval_secs: u64,
    /// Window fetched when a collection has no checkpoint yet
    pub lookback_hours: u64,
    pub checkpoint: CheckpointStrategy,
    /// Collections pulled by scheduled passes
    pub collections: Vec<Collection>,
    /// Backoff after a failed pull
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            lookback_hours: 24,
            checkpoint: CheckpointStrategy::default(),
            collections: Collection::ALL.to_vec(),
            retry_base_ms: 5_000,
            retry_max_ms: 300_000,
        }
    }
}

impl DeltaConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub const fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_hours.saturating_mul(3_600))
    }

    pub const fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Fraction of the TTL after which a hit is refreshed in the background
    pub stale_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
            stale_fraction: 0.5,
        }
    }
}

impl CacheConfig {
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Consecutive failed reconnects before a scope is degraded
    pub max_reconnect_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Change events buffered per subscription
    pub buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 6,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            buffer: 256,
        }
    }
}

impl RealtimeConfig {
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl EngineConfig {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|error| {
            Error::Config(format!(
                "Failed to read config at {}: {error}",
                path.display()
            ))
        })?;
        let config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            Error::Config(format!(
                "Failed to parse config at {}: {error}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|name| std::env::var(name).ok())
    }

    /// Apply `SYNCLINE_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = positive(&lookup, "SYNCLINE_MAX_CONCURRENT")? {
            self.governor.max_concurrent = usize::try_from(value)
                .map_err(|_| Error::Config("SYNCLINE_MAX_CONCURRENT is too large".to_string()))?;
        }
        if let Some(value) = positive(&lookup, "SYNCLINE_REQUEST_TIMEOUT_MS")? {
            self.governor.request_timeout_ms = value;
        }
        if let Some(value) = positive(&lookup, "SYNCLINE_BATCH_SIZE")? {
            self.outbox.batch_size = usize::try_from(value)
                .map_err(|_| Error::Config("SYNCLINE_BATCH_SIZE is too large".to_string()))?;
        }
        if let Some(value) = positive(&lookup, "SYNCLINE_MAX_RETRY_ATTEMPTS")? {
            self.outbox.max_retry_attempts = u32::try_from(value).map_err(|_| {
                Error::Config("SYNCLINE_MAX_RETRY_ATTEMPTS is too large".to_string())
            })?;
        }
        if let Some(value) = positive(&lookup, "SYNCLINE_PULL_INTERVAL_SECS")? {
            self.delta.interval_secs = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.governor.max_concurrent == 0 {
            return Err(Error::Config("governor.max_concurrent must be > 0".to_string()));
        }
        if self.governor.request_timeout_ms == 0 {
            return Err(Error::Config(
                "governor.request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.outbox.batch_size == 0 {
            return Err(Error::Config("outbox.batch_size must be > 0".to_string()));
        }
        if self.outbox.max_retry_attempts == 0 {
            return Err(Error::Config(
                "outbox.max_retry_attempts must be > 0".to_string(),
            ));
        }
        for (section, base, max) in [
            ("outbox", self.outbox.base_delay_ms, self.outbox.max_delay_ms),
            ("delta", self.delta.retry_base_ms, self.delta.retry_max_ms),
            (
                "realtime",
                self.realtime.base_delay_ms,
                self.realtime.max_delay_ms,
            ),
        ] {
            if base > max {
                return Err(Error::Config(format!(
                    "{section} base delay ({base}ms) exceeds max delay ({max}ms)"
                )));
            }
        }
        if !(self.cache.stale_fraction > 0.0 && self.cache.stale_fraction <= 1.0) {
            return Err(Error::Config(
                "cache.stale_fraction must be in (0, 1]".to_string(),
            ));
        }
        for (name, secs) in [
            ("outbox.drain_interval_secs", self.outbox.drain_interval_secs),
            ("delta.interval_secs", self.delta.interval_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("{name} must be > 0")));
            }
        }
        if self.realtime.buffer == 0 {
            return Err(Error::Config("realtime.buffer must be > 0".to_string()));
        }
        Ok(())
    }
}

fn positive(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<u64>() {
        Ok(0) | Err(_) => Err(Error::Config(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
        Ok(value) => Ok(Some(value)),
    }
}
