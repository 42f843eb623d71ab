//! LMDB-backed durable tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that survives process restarts.
//!
//! # Record Format
//!
//! Each value is `[expires_at: i64 millis, little-endian, 8 bytes][payload]`.
//! Keeping the expiry in a fixed header lets `purge_expired` skip the payload
//! entirely.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get` and `keys`
//! - Write transactions for `set`, `delete`, and `purge_expired`

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use toolshed_core::PersistenceError;

use super::traits::{DurablePersistence, PersistedRecord};

const HEADER_LEN: usize = 8;

fn txn_error(e: heed::Error) -> PersistenceError {
    PersistenceError::Transaction {
        reason: e.to_string(),
    }
}

/// LMDB-backed implementation of [`DurablePersistence`].
///
/// # Example
///
/// ```ignore
/// let backend = LmdbPersistence::open("/var/cache/toolshed", 64)?;
/// let store = CacheStore::new(config).with_persistence(Arc::new(backend));
/// ```
pub struct LmdbPersistence {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbPersistence {
    /// Open (or create) an LMDB environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(&path).map_err(|e| PersistenceError::Open {
            reason: e.to_string(),
        })?;

        // SAFETY: the environment is opened once per path by this process and
        // the mapping is never resized while transactions are alive.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| PersistenceError::Open {
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| PersistenceError::Open {
                reason: e.to_string(),
            })?;
        wtxn.commit().map_err(txn_error)?;

        tracing::info!(path = %path.as_ref().display(), max_size_mb, "Opened LMDB durable tier");

        Ok(Self { env, db })
    }

    fn encode(record: &PersistedRecord) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + record.payload.len());
        bytes.extend_from_slice(&record.expires_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&record.payload);
        bytes
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<PersistedRecord, PersistenceError> {
        let expires_at = Self::decode_expiry(key, bytes)?;
        Ok(PersistedRecord::new(bytes[HEADER_LEN..].to_vec(), expires_at))
    }

    fn decode_expiry(key: &str, bytes: &[u8]) -> Result<DateTime<Utc>, PersistenceError> {
        let header: [u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| PersistenceError::Corrupt {
                key: key.to_string(),
                reason: "truncated header".to_string(),
            })?;
        let millis = i64::from_le_bytes(header);
        DateTime::from_timestamp_millis(millis).ok_or_else(|| PersistenceError::Corrupt {
            key: key.to_string(),
            reason: format!("expiry out of range: {}", millis),
        })
    }
}

#[async_trait]
impl DurablePersistence for LmdbPersistence {
    async fn get(&self, key: &str) -> Result<Option<PersistedRecord>, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        match self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)? {
            Some(bytes) => Self::decode(key, bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, record: PersistedRecord) -> Result<(), PersistenceError> {
        let bytes = Self::encode(&record);
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let deleted = self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }

    async fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut keys = Vec::new();
        for item in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, _) = item.map_err(txn_error)?;
            match std::str::from_utf8(key) {
                Ok(key) => keys.push(key.to_string()),
                Err(_) => tracing::warn!("Skipping non-UTF-8 key in durable tier"),
            }
        }
        Ok(keys)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let expired = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            let mut expired = Vec::new();
            for item in self.db.iter(&rtxn).map_err(txn_error)? {
                let (key, bytes) = item.map_err(txn_error)?;
                let label = String::from_utf8_lossy(key);
                // Corrupt records are purged along with expired ones.
                let dead = match Self::decode_expiry(&label, bytes) {
                    Ok(expires_at) => now > expires_at,
                    Err(_) => true,
                };
                if dead {
                    expired.push(key.to_vec());
                }
            }
            expired
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut purged = 0u64;
        for key in &expired {
            if self.db.delete(&mut wtxn, key).map_err(txn_error)? {
                purged += 1;
            }
        }
        wtxn.commit().map_err(txn_error)?;

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbPersistence, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let backend =
            LmdbPersistence::open(temp_dir.path(), 10).expect("backend creation should succeed");
        (backend, temp_dir)
    }

    fn at_millis(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).expect("valid timestamp")
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (backend, _temp_dir) = create_test_backend();
        let record = PersistedRecord::new(br#"{"v":1}"#.to_vec(), at_millis(1_700_000_000_000));

        backend
            .set("tools:{}", record.clone())
            .await
            .expect("set should succeed");

        let cached = backend.get("tools:{}").await.expect("get should succeed");
        assert_eq!(cached, Some(record));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (backend, _temp_dir) = create_test_backend();
        let cached = backend.get("missing").await.expect("get should succeed");
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (backend, _temp_dir) = create_test_backend();
        let expires_at = at_millis(1_700_000_000_000);

        backend
            .set("k", PersistedRecord::new(b"old".to_vec(), expires_at))
            .await
            .expect("set should succeed");
        backend
            .set("k", PersistedRecord::new(b"new".to_vec(), expires_at))
            .await
            .expect("set should succeed");

        let cached = backend.get("k").await.expect("get should succeed");
        assert_eq!(cached.expect("cached should be Some").payload, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_delete() {
        let (backend, _temp_dir) = create_test_backend();
        backend
            .set("k", PersistedRecord::new(vec![], Utc::now()))
            .await
            .expect("set should succeed");

        assert!(backend.delete("k").await.expect("delete should succeed"));
        assert!(!backend.delete("k").await.expect("delete should succeed"));
        assert!(backend.get("k").await.expect("get should succeed").is_none());
    }

    #[tokio::test]
    async fn test_keys() {
        let (backend, _temp_dir) = create_test_backend();
        for key in ["tools:{}", r#"tools:{"page":2}"#, "categories:{}"] {
            backend
                .set(key, PersistedRecord::new(vec![], Utc::now()))
                .await
                .expect("set should succeed");
        }

        let mut keys = backend.keys().await.expect("keys should succeed");
        keys.sort();
        assert_eq!(keys, vec!["categories:{}", "tools:{}", r#"tools:{"page":2}"#]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (backend, _temp_dir) = create_test_backend();
        let now = at_millis(1_700_000_000_000);

        backend
            .set("old", PersistedRecord::new(vec![], now - chrono::Duration::seconds(5)))
            .await
            .expect("set should succeed");
        backend
            .set("new", PersistedRecord::new(vec![], now + chrono::Duration::seconds(5)))
            .await
            .expect("set should succeed");

        let purged = backend.purge_expired(now).await.expect("purge should succeed");
        assert_eq!(purged, 1);
        assert_eq!(backend.keys().await.expect("keys should succeed"), vec!["new"]);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let record = PersistedRecord::new(b"durable".to_vec(), at_millis(1_700_000_000_000));
        {
            let backend = LmdbPersistence::open(temp_dir.path(), 10).expect("open should succeed");
            backend.set("k", record.clone()).await.expect("set should succeed");
        }

        let backend = LmdbPersistence::open(temp_dir.path(), 10).expect("reopen should succeed");
        assert_eq!(backend.get("k").await.expect("get should succeed"), Some(record));
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let result = LmdbPersistence::decode("k", &[1, 2, 3]);
        assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));
    }
}
