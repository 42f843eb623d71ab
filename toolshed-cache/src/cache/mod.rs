//! Two-tier read-through cache.
//!
//! Entries live in a bounded in-memory tier and, when requested per call, in
//! a durable tier behind [`DurablePersistence`]. Reads go through the
//! [`RequestCoordinator`], which deduplicates concurrent misses and serves
//! stale entries while a [`RefreshScheduler`] revalidates them.
//!
//! # Freshness
//!
//! Every entry carries two horizons measured from its `created_at`:
//!
//! - before `stale_after` it is fresh and served as-is
//! - between `stale_after` and `ttl` it is stale, served only when the call
//!   opts into stale-while-revalidate
//! - past `ttl` it is expired and never served from either tier
//!
//! # Invalidation
//!
//! `invalidate` and `invalidate_matching` log their target in an
//! [`InvalidationWatermark`]. A fetch or refresh that started before an
//! invalidation covering its key carries a [`WriteTicket`] from the older
//! watermark, and its result is discarded instead of resurrecting the removed
//! entry. Writes to keys the invalidation did not cover are unaffected.

pub mod entry;
pub mod key;
pub mod lmdb_backend;
pub mod persistence;
pub mod read_through;
pub mod refresh;
pub mod store;
pub mod traits;
pub mod watermark;

pub use entry::{CacheEntry, CacheRead, FetchOptions, ReadSource};
pub use key::{CacheKey, Invalidation, KeyPattern};
pub use lmdb_backend::LmdbPersistence;
pub use persistence::{decode_entry, encode_entry, InMemoryPersistence};
pub use read_through::RequestCoordinator;
pub use refresh::{RefreshMetrics, RefreshScheduler};
pub use store::{CacheStats, CacheStore};
pub use traits::{CacheValue, DurablePersistence, Fetcher, PersistedRecord};
pub use watermark::{InvalidationWatermark, Watermark, WriteTicket};
