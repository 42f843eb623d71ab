//! Durable record encoding and the in-memory persistence adapter.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toolshed_core::PersistenceError;

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::traits::{CacheValue, DurablePersistence, PersistedRecord};

/// Serialized body of a durable record.
#[derive(Serialize, Deserialize)]
struct StoredEntry<V> {
    value: V,
    created_at: DateTime<Utc>,
    ttl_ms: u64,
    stale_after_ms: u64,
}

/// Encode an entry into a durable record.
pub fn encode_entry<V: CacheValue>(entry: &CacheEntry<V>) -> Result<PersistedRecord, PersistenceError> {
    let stored = StoredEntry {
        value: entry.value(),
        created_at: entry.created_at(),
        ttl_ms: duration_ms(entry.ttl()),
        stale_after_ms: duration_ms(entry.stale_after()),
    };
    let payload = serde_json::to_vec(&stored).map_err(|e| PersistenceError::Serialization {
        key: entry.key().to_string(),
        reason: e.to_string(),
    })?;
    Ok(PersistedRecord::new(payload, entry.expires_at()))
}

/// Decode a durable record back into an entry.
pub fn decode_entry<V: CacheValue>(
    key: &CacheKey,
    record: &PersistedRecord,
) -> Result<CacheEntry<V>, PersistenceError> {
    let stored: StoredEntry<V> =
        serde_json::from_slice(&record.payload).map_err(|e| PersistenceError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    Ok(CacheEntry::new(
        key.clone(),
        stored.value,
        stored.created_at,
        Duration::from_millis(stored.ttl_ms),
        Duration::from_millis(stored.stale_after_ms),
    ))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Process-local durable tier backed by a map.
///
/// Survives a `CacheStore` being rebuilt over the same instance, which is
/// what tests use to exercise the durable read path without LMDB.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    records: RwLock<HashMap<String, PersistedRecord>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurablePersistence for InMemoryPersistence {
    async fn get(&self, key: &str) -> Result<Option<PersistedRecord>, PersistenceError> {
        let records = self
            .records
            .read()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(records.get(key).cloned())
    }

    async fn set(&self, key: &str, record: PersistedRecord) -> Result<(), PersistenceError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        records.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(records.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        let records = self
            .records
            .read()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(records.keys().cloned().collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}
