//! Toolshed Cache - Read-Through Cache and Counter Write Coalescing
//!
//! Sits between request handlers and the directory database:
//!
//! - [`cache`]: keyed read-through cache with singleflight fetches,
//!   stale-while-revalidate and an optional durable LMDB tier
//! - [`coalescer`]: debounced batching of counter increments (view counts,
//!   clicks) into one write per target
//! - [`service`]: the [`CacheService`] facade composing both
//! - [`jobs`]: the expiry sweeper
//! - [`telemetry`]: tracing subscriber setup for binaries

pub mod cache;
pub mod coalescer;
pub mod jobs;
pub mod service;
pub mod telemetry;

pub use cache::{
    CacheEntry, CacheKey, CacheRead, CacheStats, CacheStore, CacheValue, DurablePersistence,
    FetchOptions, Fetcher, InMemoryPersistence, Invalidation, KeyPattern, LmdbPersistence,
    PersistedRecord, ReadSource, RequestCoordinator, RefreshScheduler,
};
pub use coalescer::{
    CoalescerState, CoalescerStats, CounterStore, DeadLetter, FlushReport, WriteCoalescer,
};
pub use service::{CacheService, CacheServiceBuilder, CacheServiceStats};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

pub use toolshed_core::{
    CacheConfig, CoalescerConfig, ConfigError, FetchError, FlushError, PersistenceError,
    ToolshedError, ToolshedResult,
};
