//! Background refresh for stale entries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::entry::FetchOptions;
use super::key::CacheKey;
use super::read_through::InFlightGuard;
use super::store::CacheStore;
use super::traits::{CacheValue, Fetcher};

/// Counters for background refreshes.
#[derive(Debug, Default)]
pub struct RefreshMetrics {
    pub scheduled: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub discarded: AtomicU64,
}

/// Fire-and-forget refresher with one refresh per key at a time.
pub struct RefreshScheduler<V> {
    store: Arc<CacheStore<V>>,
    in_flight: Arc<DashMap<CacheKey, ()>>,
    metrics: Arc<RefreshMetrics>,
}

impl<V: CacheValue> RefreshScheduler<V> {
    pub fn new(store: Arc<CacheStore<V>>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            metrics: Arc::new(RefreshMetrics::default()),
        }
    }

    /// Start a background refresh of `key` unless one is already running.
    ///
    /// Never suspends. On success the new value replaces the stale entry
    /// (unless an invalidation or newer write intervened); on failure the
    /// stale entry is left untouched. Must be called from within a Tokio
    /// runtime.
    pub fn schedule<F>(&self, key: CacheKey, fetcher: F, options: FetchOptions) -> bool
    where
        F: Fetcher<V>,
    {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                trace!(key = %key, "Refresh already in flight");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let guard = InFlightGuard::new(self.in_flight.clone(), key.clone());
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let ticket = store.ticket();
        metrics.scheduled.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let _guard = guard;
            match fetcher.fetch().await {
                Ok(value) => {
                    if store.set_if_current(key.clone(), value, &options, ticket).await {
                        metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, "Background refresh stored");
                    } else {
                        metrics.discarded.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, "Background refresh superseded");
                    }
                }
                Err(e) => {
                    metrics.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Background refresh failed, keeping stale entry");
                }
            }
        });

        true
    }

    /// Number of refreshes currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether a refresh for `key` is running.
    pub fn is_refreshing(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn metrics(&self) -> &RefreshMetrics {
        &self.metrics
    }
}
