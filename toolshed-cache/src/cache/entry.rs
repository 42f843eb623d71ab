//! Cache entries, per-call freshness policy and read results.
//!
//! Entries carry their own TTL and stale-after window. Every read returns a
//! [`CacheRead`] that says where the value came from, so callers can tell a
//! fresh hit from a stale one being revalidated in the background.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toolshed_core::{add_duration, CacheConfig, ConfigError, ToolshedResult};

use super::key::CacheKey;

/// Freshness policy for a single `fetch_with_cache` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Hard expiry; an entry older than this is never served.
    pub ttl: Duration,
    /// Age after which the entry is stale. Must not exceed `ttl`.
    pub stale_after: Duration,
    /// Serve stale entries immediately and refresh them in the background.
    pub stale_while_revalidate: bool,
    /// Write the entry through to the durable tier.
    pub persistent: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl FetchOptions {
    /// Options using the cache-wide defaults, SWR on, memory only.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            ttl: config.default_ttl,
            stale_after: config.default_stale_after,
            stale_while_revalidate: true,
            persistent: false,
        }
    }

    /// Options with an explicit TTL that is never stale before it expires.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_after: ttl,
            stale_while_revalidate: false,
            persistent: false,
        }
    }

    /// Set the TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the stale-after threshold.
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Enable or disable stale-while-revalidate.
    pub fn swr(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    /// Enable or disable durable write-through.
    pub fn persistent(mut self, enabled: bool) -> Self {
        self.persistent = enabled;
        self
    }

    /// Validate the options.
    ///
    /// Validates:
    /// - ttl is positive
    /// - stale_after <= ttl
    pub fn validate(&self) -> ToolshedResult<()> {
        if self.ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "ttl".to_string(),
                value: format!("{:?}", self.ttl),
                reason: "ttl must be positive".to_string(),
            }
            .into());
        }

        if self.stale_after > self.ttl {
            return Err(ConfigError::InvalidValue {
                field: "stale_after".to_string(),
                value: format!("{:?}", self.stale_after),
                reason: "stale_after must not exceed ttl".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// A cached value with its lifecycle metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    key: CacheKey,
    value: V,
    created_at: DateTime<Utc>,
    ttl: Duration,
    stale_after: Duration,
}

impl<V> CacheEntry<V> {
    /// Create an entry written at `created_at`.
    pub fn new(
        key: CacheKey,
        value: V,
        created_at: DateTime<Utc>,
        ttl: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            key,
            value,
            created_at,
            ttl,
            stale_after: stale_after.min(ttl),
        }
    }

    /// Create an entry using the TTL window of `options`.
    pub fn from_options(
        key: CacheKey,
        value: V,
        created_at: DateTime<Utc>,
        options: &FetchOptions,
    ) -> Self {
        Self::new(key, value, created_at, options.ttl, options.stale_after)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// `created_at + ttl`.
    pub fn expires_at(&self) -> DateTime<Utc> {
        add_duration(self.created_at, self.ttl)
    }

    /// `created_at + stale_after`.
    pub fn stale_at(&self) -> DateTime<Utc> {
        add_duration(self.created_at, self.stale_after)
    }

    /// True once `now` is past the stale threshold.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.stale_at()
    }

    /// True once `now` is past the hard expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// How long ago the entry was written.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Where the value of a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Cache hit within the freshness window.
    Fresh,
    /// Stale hit served while a background refresh runs.
    Stale,
    /// This caller ran the fetcher.
    Fetched,
    /// This caller joined a fetch already in flight.
    Joined,
}

/// Result of a cache read, carrying provenance metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    source: ReadSource,
    created_at: Option<DateTime<Utc>>,
}

impl<T> CacheRead<T> {
    /// Wrap a cache hit.
    pub fn from_entry(entry: CacheEntry<T>, source: ReadSource) -> Self {
        let created_at = Some(entry.created_at);
        Self {
            value: entry.value,
            source,
            created_at,
        }
    }

    /// Wrap a value produced by a fetch.
    pub fn from_fetch(value: T, source: ReadSource) -> Self {
        Self {
            value,
            source,
            created_at: None,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Get a reference to the underlying value.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// When the served entry was written, for cache hits.
    pub fn cached_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Check if this was served from the cache (fresh or stale).
    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Fresh | ReadSource::Stale)
    }

    /// Check if this value is stale and being revalidated.
    pub fn is_stale(&self) -> bool {
        self.source == ReadSource::Stale
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            source: self.source,
            created_at: self.created_at,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
