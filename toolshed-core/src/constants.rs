//! Constants for the Toolshed cache layer
//!
//! Defaults used by the configuration types when neither the caller nor the
//! environment supplies a value.

// ============================================================================
// READ-THROUGH CACHE
// ============================================================================

/// Default capacity of the in-memory tier (entries)
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;

/// Default hard expiry for cached entries in seconds (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default stale-while-revalidate threshold in seconds
pub const DEFAULT_CACHE_STALE_AFTER_SECS: u64 = 60;

/// Default interval between expired-entry sweeps in seconds
pub const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default map size of the LMDB durable tier in megabytes
pub const DEFAULT_DURABLE_MAX_SIZE_MB: usize = 64;

/// Recent invalidations remembered for checking in-flight writes
pub const INVALIDATION_LOG_CAPACITY: usize = 1024;

// ============================================================================
// WRITE COALESCER
// ============================================================================

/// Default debounce delay before pending increments are flushed
pub const DEFAULT_COALESCER_DELAY_MS: u64 = 2000;

/// Upper bound on how long a batch may be deferred by continuous increments
pub const DEFAULT_COALESCER_MAX_DELAY_MS: u64 = 10_000;

/// Consecutive failed writes before a target's delta is dead-lettered
pub const DEFAULT_COALESCER_MAX_ATTEMPTS: u32 = 5;

/// Backoff after the first failed write of a target
pub const DEFAULT_COALESCER_INITIAL_BACKOFF_MS: u64 = 500;

/// Ceiling for the exponential backoff between retries
pub const DEFAULT_COALESCER_MAX_BACKOFF_MS: u64 = 60_000;

/// Growth factor applied to the backoff after each failure
pub const DEFAULT_COALESCER_BACKOFF_MULTIPLIER: f64 = 2.0;

// ============================================================================
// KEYS
// ============================================================================

/// Separator between a key's namespace and its canonical parameters
pub const KEY_NAMESPACE_SEPARATOR: char = ':';

/// Wildcard accepted by pattern invalidation
pub const KEY_WILDCARD: char = '*';
