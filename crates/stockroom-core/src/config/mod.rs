//! Sync engine configuration.
//!
//! `SyncSettings` is read from an optional JSON file and then overridden by
//! `STOCKROOM_*` environment variables. Durations are written as whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::normalize_text_option;

pub const ENV_MAX_RETRIES: &str = "STOCKROOM_MAX_RETRIES";
pub const ENV_RETRY_DELAY_SECS: &str = "STOCKROOM_RETRY_DELAY_SECS";
pub const ENV_BATCH_SIZE: &str = "STOCKROOM_BATCH_SIZE";
pub const ENV_SYNC_INTERVAL_SECS: &str = "STOCKROOM_SYNC_INTERVAL_SECS";
pub const ENV_DUPLICATE_WINDOW_SECS: &str = "STOCKROOM_DUPLICATE_WINDOW_SECS";

/// How the delay before re-attempting a failed push grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// Delay doubles per attempt, capped at `max_retry_delay`
    Exponential,
}

/// Tunables for the push/pull pipelines and the realtime listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Attempts before an operation is dead-lettered
    pub max_retries: u32,
    #[serde(rename = "retry_delay_secs", with = "duration_secs")]
    pub retry_delay: Duration,
    pub retry_policy: RetryPolicy,
    #[serde(rename = "max_retry_delay_secs", with = "duration_secs")]
    pub max_retry_delay: Duration,
    /// Operations pushed per batch
    pub batch_size: usize,
    #[serde(rename = "sync_interval_secs", with = "duration_secs")]
    pub sync_interval: Duration,
    /// Creation-time tolerance for merging duplicate candidates
    #[serde(rename = "duplicate_window_secs", with = "duration_secs")]
    pub duplicate_window: Duration,
    /// Recently written remote ids remembered for echo suppression
    pub tracked_id_capacity: usize,
    #[serde(rename = "cache_ttl_secs", with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Error messages kept for status reporting
    pub max_recorded_errors: usize,
    /// Create a stock line for products announcing a `stock_quantity`
    pub ensure_initial_stock: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            retry_policy: RetryPolicy::Fixed,
            max_retry_delay: Duration::from_secs(5 * 60),
            batch_size: 10,
            sync_interval: Duration::from_secs(5 * 60),
            duplicate_window: Duration::from_secs(30),
            tracked_id_capacity: 100,
            cache_ttl: Duration::from_secs(5),
            max_recorded_errors: 50,
            ensure_initial_stock: true,
        }
    }
}

impl SyncSettings {
    /// Load settings from `path` (when given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::from_json(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        settings.with_overrides(|key| std::env::var(key).ok())
    }

    /// Parse a JSON settings document; missing fields take their defaults.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|error| Error::InvalidInput(format!("invalid sync settings: {error}")))
    }

    /// Apply `STOCKROOM_*` overrides looked up through `lookup`, then validate.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| normalize_text_option(lookup(key));

        if let Some(value) = read(ENV_MAX_RETRIES) {
            self.max_retries = parse_number(ENV_MAX_RETRIES, &value)?;
        }
        if let Some(value) = read(ENV_RETRY_DELAY_SECS) {
            self.retry_delay = Duration::from_secs(parse_number(ENV_RETRY_DELAY_SECS, &value)?);
        }
        if let Some(value) = read(ENV_BATCH_SIZE) {
            self.batch_size = parse_number(ENV_BATCH_SIZE, &value)?;
        }
        if let Some(value) = read(ENV_SYNC_INTERVAL_SECS) {
            self.sync_interval =
                Duration::from_secs(parse_number(ENV_SYNC_INTERVAL_SECS, &value)?);
        }
        if let Some(value) = read(ENV_DUPLICATE_WINDOW_SECS) {
            self.duplicate_window =
                Duration::from_secs(parse_number(ENV_DUPLICATE_WINDOW_SECS, &value)?);
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidInput("max_retries must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::InvalidInput("sync_interval must be positive".into()));
        }
        if self.tracked_id_capacity == 0 {
            return Err(Error::InvalidInput(
                "tracked_id_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Delay before attempt number `retry_count + 1` of a failed operation.
    pub fn retry_delay_for(&self, retry_count: u32) -> Duration {
        match self.retry_policy {
            RetryPolicy::Fixed => self.retry_delay,
            RetryPolicy::Exponential => {
                let exponent = retry_count.saturating_sub(1).min(16);
                self.retry_delay
                    .saturating_mul(1 << exponent)
                    .min(self.max_retry_delay)
            }
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{key} must be a non-negative integer, got `{value}`")))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
