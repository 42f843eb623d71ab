//! Configuration types

use crate::constants::*;
use crate::{ConfigError, ToolshedResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Read an environment variable and parse it, falling back to `default`
/// when the variable is unset or unparsable.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::ToolshedError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

// ============================================================================
// READ-THROUGH CACHE
// ============================================================================

/// Configuration for the two-tier read-through cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity of the in-memory tier; the oldest insert is evicted beyond it.
    pub max_entries: usize,
    /// Default hard expiry for entries.
    pub default_ttl: Duration,
    /// Default age after which an entry is served stale and refreshed.
    pub default_stale_after: Duration,
    /// How often the sweeper purges expired entries.
    pub sweep_interval: Duration,
    /// Directory of the LMDB durable tier. `None` disables the durable tier.
    pub durable_path: Option<PathBuf>,
    /// Map size of the LMDB durable tier.
    pub durable_max_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            default_stale_after: Duration::from_secs(DEFAULT_CACHE_STALE_AFTER_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_CACHE_SWEEP_INTERVAL_SECS),
            durable_path: None,
            durable_max_size_mb: DEFAULT_DURABLE_MAX_SIZE_MB,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TOOLSHED_CACHE_MAX_ENTRIES`: In-memory capacity (default: 1000)
    /// - `TOOLSHED_CACHE_TTL_SECS`: Default TTL (default: 300)
    /// - `TOOLSHED_CACHE_STALE_AFTER_SECS`: Default SWR threshold (default: 60)
    /// - `TOOLSHED_CACHE_SWEEP_INTERVAL_SECS`: Sweep interval (default: 60)
    /// - `TOOLSHED_CACHE_DURABLE_PATH`: LMDB directory (default: unset, memory only)
    /// - `TOOLSHED_CACHE_DURABLE_MAX_MB`: LMDB map size (default: 64)
    pub fn from_env() -> Self {
        Self {
            max_entries: env_or("TOOLSHED_CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
            default_ttl: Duration::from_secs(env_or(
                "TOOLSHED_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            default_stale_after: Duration::from_secs(env_or(
                "TOOLSHED_CACHE_STALE_AFTER_SECS",
                DEFAULT_CACHE_STALE_AFTER_SECS,
            )),
            sweep_interval: Duration::from_secs(env_or(
                "TOOLSHED_CACHE_SWEEP_INTERVAL_SECS",
                DEFAULT_CACHE_SWEEP_INTERVAL_SECS,
            )),
            durable_path: std::env::var("TOOLSHED_CACHE_DURABLE_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            durable_max_size_mb: env_or("TOOLSHED_CACHE_DURABLE_MAX_MB", DEFAULT_DURABLE_MAX_SIZE_MB),
        }
    }

    /// Set the in-memory capacity.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the default stale-after threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.default_stale_after = stale_after;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Enable the durable tier at `path`.
    pub fn with_durable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.durable_path = Some(path.into());
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - max_entries > 0
    /// - default_ttl and sweep_interval are positive
    /// - default_stale_after <= default_ttl
    /// - durable_max_size_mb > 0 when a durable path is set
    pub fn validate(&self) -> ToolshedResult<()> {
        if self.max_entries == 0 {
            return Err(invalid(
                "max_entries",
                self.max_entries,
                "max_entries must be greater than 0",
            ));
        }

        if self.default_ttl.is_zero() {
            return Err(invalid(
                "default_ttl",
                format!("{:?}", self.default_ttl),
                "default_ttl must be positive",
            ));
        }

        if self.default_stale_after > self.default_ttl {
            return Err(invalid(
                "default_stale_after",
                format!("{:?}", self.default_stale_after),
                "default_stale_after must not exceed default_ttl",
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(invalid(
                "sweep_interval",
                format!("{:?}", self.sweep_interval),
                "sweep_interval must be positive",
            ));
        }

        if self.durable_path.is_some() && self.durable_max_size_mb == 0 {
            return Err(invalid(
                "durable_max_size_mb",
                self.durable_max_size_mb,
                "durable_max_size_mb must be greater than 0",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// WRITE COALESCER
// ============================================================================

/// Configuration for the counter write coalescer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Quiet period after the last increment before a flush fires.
    pub delay: Duration,
    /// Cap on how long the first increment of a batch may wait.
    pub max_delay: Duration,
    /// Consecutive failed writes before a target's delta is dead-lettered.
    pub max_attempts: u32,
    /// Backoff after the first failure of a target.
    pub initial_backoff: Duration,
    /// Ceiling for the backoff.
    pub max_backoff: Duration,
    /// Growth factor applied per consecutive failure.
    pub backoff_multiplier: f64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(DEFAULT_COALESCER_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_COALESCER_MAX_DELAY_MS),
            max_attempts: DEFAULT_COALESCER_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_COALESCER_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_COALESCER_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_COALESCER_BACKOFF_MULTIPLIER,
        }
    }
}

impl CoalescerConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TOOLSHED_COALESCER_DELAY_MS` (default: 2000)
    /// - `TOOLSHED_COALESCER_MAX_DELAY_MS` (default: 10000)
    /// - `TOOLSHED_COALESCER_MAX_ATTEMPTS` (default: 5)
    /// - `TOOLSHED_COALESCER_INITIAL_BACKOFF_MS` (default: 500)
    /// - `TOOLSHED_COALESCER_MAX_BACKOFF_MS` (default: 60000)
    /// - `TOOLSHED_COALESCER_BACKOFF_MULTIPLIER` (default: 2.0)
    pub fn from_env() -> Self {
        Self {
            delay: Duration::from_millis(env_or(
                "TOOLSHED_COALESCER_DELAY_MS",
                DEFAULT_COALESCER_DELAY_MS,
            )),
            max_delay: Duration::from_millis(env_or(
                "TOOLSHED_COALESCER_MAX_DELAY_MS",
                DEFAULT_COALESCER_MAX_DELAY_MS,
            )),
            max_attempts: env_or("TOOLSHED_COALESCER_MAX_ATTEMPTS", DEFAULT_COALESCER_MAX_ATTEMPTS),
            initial_backoff: Duration::from_millis(env_or(
                "TOOLSHED_COALESCER_INITIAL_BACKOFF_MS",
                DEFAULT_COALESCER_INITIAL_BACKOFF_MS,
            )),
            max_backoff: Duration::from_millis(env_or(
                "TOOLSHED_COALESCER_MAX_BACKOFF_MS",
                DEFAULT_COALESCER_MAX_BACKOFF_MS,
            )),
            backoff_multiplier: env_or(
                "TOOLSHED_COALESCER_BACKOFF_MULTIPLIER",
                DEFAULT_COALESCER_BACKOFF_MULTIPLIER,
            ),
        }
    }

    /// Set the debounce delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the maximum deferral of a batch.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the number of attempts before dead-lettering.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff window.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Backoff to apply after `failures` consecutive failed writes.
    ///
    /// `initial_backoff * multiplier^(failures - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = self
            .backoff_multiplier
            .powi(failures.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ToolshedResult<()> {
        if self.delay.is_zero() {
            return Err(invalid(
                "delay",
                format!("{:?}", self.delay),
                "delay must be positive",
            ));
        }

        if self.max_delay < self.delay {
            return Err(invalid(
                "max_delay",
                format!("{:?}", self.max_delay),
                "max_delay must be at least delay",
            ));
        }

        if self.max_attempts == 0 {
            return Err(invalid(
                "max_attempts",
                self.max_attempts,
                "max_attempts must be greater than 0",
            ));
        }

        if self.initial_backoff > self.max_backoff {
            return Err(invalid(
                "initial_backoff",
                format!("{:?}", self.initial_backoff),
                "initial_backoff must not exceed max_backoff",
            ));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(invalid(
                "backoff_multiplier",
                self.backoff_multiplier,
                "backoff_multiplier must be at least 1.0",
            ));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolshedError;

    #[test]
    fn test_cache_config_defaults_are_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CoalescerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::new()
            .with_max_entries(50)
            .with_ttl(Duration::from_secs(10))
            .with_stale_after(Duration::from_secs(2))
            .with_sweep_interval(Duration::from_secs(1))
            .with_durable_path("/tmp/toolshed");

        assert_eq!(config.max_entries, 50);
        assert_eq!(config.default_ttl, Duration::from_secs(10));
        assert_eq!(config.default_stale_after, Duration::from_secs(2));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.durable_path, Some(PathBuf::from("/tmp/toolshed")));
    }

    #[test]
    fn test_cache_config_rejects_stale_after_beyond_ttl() {
        let config = CacheConfig::new()
            .with_ttl(Duration::from_secs(1))
            .with_stale_after(Duration::from_secs(2));
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ToolshedError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "default_stale_after"
        ));
    }

    #[test]
    fn test_cache_config_rejects_zero_capacity() {
        let config = CacheConfig::new().with_max_entries(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_coalescer_config_rejects_cap_below_delay() {
        let config = CoalescerConfig::default()
            .with_delay(Duration::from_secs(5))
            .with_max_delay(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_coalescer_config_rejects_zero_attempts() {
        let config = CoalescerConfig::default().with_max_attempts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = CoalescerConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(config.backoff_for(0), Duration::ZERO);
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(60), Duration::from_millis(1000));
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_backoff_is_monotonic_and_capped(
                initial_ms in 1u64..1_000,
                extra_ms in 0u64..60_000,
                multiplier in 1.0f64..4.0,
                failures in 1u32..64,
            ) {
                let mut config = CoalescerConfig::default().with_backoff(
                    Duration::from_millis(initial_ms),
                    Duration::from_millis(initial_ms + extra_ms),
                );
                config.backoff_multiplier = multiplier;

                let here = config.backoff_for(failures);
                let next = config.backoff_for(failures + 1);
                prop_assert!(next >= here);
                prop_assert!(here <= config.max_backoff);
                prop_assert!(here >= config.initial_backoff.min(config.max_backoff));
            }
        }
    }
}
