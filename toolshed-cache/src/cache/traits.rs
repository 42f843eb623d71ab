//! Cache capability traits and value marker.
//!
//! This module defines the capabilities the cache consumes from its callers:
//! the fetcher that produces a value on miss, and the optional durable tier.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use toolshed_core::{PersistenceError, ToolshedResult};

/// Marker trait for types that can be cached.
///
/// Values are cloned out to every reader and serialized with `serde_json`
/// when written to the durable tier.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Produces the value for a key on cache miss or refresh.
///
/// Implemented for any `Fn() -> impl Future<Output = ToolshedResult<V>>`
/// closure, so callers usually pass an `async move` closure:
///
/// ```ignore
/// let db = db.clone();
/// cache.fetch_with_cache(key, move || {
///     let db = db.clone();
///     async move { db.list_tools(&filters).await }
/// }, opts).await?;
/// ```
#[async_trait]
pub trait Fetcher<V: Send + 'static>: Send + Sync + 'static {
    /// Retrieve the value from the backing source.
    async fn fetch(&self) -> ToolshedResult<V>;
}

#[async_trait]
impl<V, F, Fut> Fetcher<V> for F
where
    V: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolshedResult<V>> + Send + 'static,
{
    async fn fetch(&self) -> ToolshedResult<V> {
        (self)().await
    }
}

/// A serialized entry as stored by the durable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    /// Opaque serialized entry.
    pub payload: Vec<u8>,
    /// Hard expiry; the record must not be served after this instant.
    pub expires_at: DateTime<Utc>,
}

impl PersistedRecord {
    /// Create a record.
    pub fn new(payload: Vec<u8>, expires_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            expires_at,
        }
    }

    /// Check whether the record has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Durable tier capability for pluggable persistence.
///
/// This trait abstracts over the backing store of the second tier (LMDB,
/// in-memory, anything else). The cache treats every error as "absent" or
/// "no-op": the memory tier stays authoritative.
///
/// # Key Format
///
/// Keys are the canonical strings produced by `CacheKey`.
#[async_trait]
pub trait DurablePersistence: Send + Sync + 'static {
    /// Get a record, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<PersistedRecord>, PersistenceError>;

    /// Store a record, overwriting any previous one.
    async fn set(&self, key: &str, record: PersistedRecord) -> Result<(), PersistenceError>;

    /// Delete a record. Returns true if something was removed.
    async fn delete(&self, key: &str) -> Result<bool, PersistenceError>;

    /// List every stored key. Used by wildcard invalidation.
    async fn keys(&self) -> Result<Vec<String>, PersistenceError>;

    /// Remove every record whose expiry is before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError>;
}
