//! Read-through orchestration with request deduplication.
//!
//! On a miss the first caller becomes the leader: it registers a pending
//! fetch for the key and runs the fetcher on its own task. Every caller that
//! misses while the fetch is pending subscribes to the same result instead of
//! starting another fetch. Stale hits are served immediately and handed to
//! the [`RefreshScheduler`].
//!
//! # Example
//!
//! ```ignore
//! let coordinator = RequestCoordinator::new(store);
//! let listing = coordinator
//!     .fetch(&key, move || list_tools(filters.clone()), &FetchOptions::default())
//!     .await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use toolshed_core::{FetchError, ToolshedError, ToolshedResult};
use tracing::{debug, trace, warn};

use super::entry::{CacheRead, FetchOptions, ReadSource};
use super::key::CacheKey;
use super::refresh::RefreshScheduler;
use super::store::CacheStore;
use super::traits::{CacheValue, Fetcher};

/// Outcome slot of a pending fetch; `None` until it settles.
type Settled<V> = Option<ToolshedResult<V>>;

/// Removes `key` from an in-flight map when dropped.
///
/// Held by the task doing the work, so the slot is released on success,
/// failure, panic and runtime shutdown alike.
pub(crate) struct InFlightGuard<T> {
    map: Arc<DashMap<CacheKey, T>>,
    key: CacheKey,
}

impl<T> InFlightGuard<T> {
    pub(crate) fn new(map: Arc<DashMap<CacheKey, T>>, key: CacheKey) -> Self {
        Self { map, key }
    }
}

impl<T> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[derive(Debug, Default)]
struct CoordinatorCounters {
    fetches: AtomicU64,
    joined: AtomicU64,
}

/// Read-through cache front with singleflight and stale-while-revalidate.
pub struct RequestCoordinator<V> {
    store: Arc<CacheStore<V>>,
    refresher: RefreshScheduler<V>,
    in_flight: Arc<DashMap<CacheKey, watch::Receiver<Settled<V>>>>,
    counters: CoordinatorCounters,
}

impl<V: CacheValue> RequestCoordinator<V> {
    pub fn new(store: Arc<CacheStore<V>>) -> Self {
        Self {
            refresher: RefreshScheduler::new(store.clone()),
            store,
            in_flight: Arc::new(DashMap::new()),
            counters: CoordinatorCounters::default(),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    pub fn refresher(&self) -> &RefreshScheduler<V> {
        &self.refresher
    }

    /// Return the cached value for `key`, fetching it on miss.
    pub async fn fetch<F>(&self, key: &CacheKey, fetcher: F, options: &FetchOptions) -> ToolshedResult<V>
    where
        F: Fetcher<V>,
    {
        self.fetch_read(key, fetcher, options)
            .await
            .map(CacheRead::into_value)
    }

    /// Like [`fetch`](Self::fetch), but reports where the value came from.
    pub async fn fetch_read<F>(
        &self,
        key: &CacheKey,
        fetcher: F,
        options: &FetchOptions,
    ) -> ToolshedResult<CacheRead<V>>
    where
        F: Fetcher<V>,
    {
        options.validate()?;

        if let Some(entry) = self.store.load(key).await {
            let now = self.store.now();
            if !entry.is_stale(now) {
                self.store.record_hit();
                trace!(key = %key, "Fresh hit");
                return Ok(CacheRead::from_entry(entry, ReadSource::Fresh));
            }
            if options.stale_while_revalidate {
                self.store.record_stale_hit();
                let scheduled = self.refresher.schedule(key.clone(), fetcher, options.clone());
                trace!(key = %key, scheduled, "Stale hit, serving while revalidating");
                return Ok(CacheRead::from_entry(entry, ReadSource::Stale));
            }
            trace!(key = %key, "Stale hit without revalidation, refetching");
        }

        self.store.record_miss();
        self.join_or_lead(key, fetcher, options).await
    }

    /// Warm `key` unless it already holds a fresh entry.
    ///
    /// Returns `Ok(false)` when the entry was already fresh, `Ok(true)` once a
    /// fetch (or a join of one already running) has settled successfully.
    pub async fn prefetch<F>(&self, key: &CacheKey, fetcher: F, options: &FetchOptions) -> ToolshedResult<bool>
    where
        F: Fetcher<V>,
    {
        options.validate()?;

        if let Some(entry) = self.store.load(key).await {
            if !entry.is_stale(self.store.now()) {
                trace!(key = %key, "Prefetch skipped, entry is warm");
                return Ok(false);
            }
        }

        self.join_or_lead(key, fetcher, options).await?;
        Ok(true)
    }

    /// Number of fetches currently pending.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Total fetcher invocations started on the miss path.
    pub fn fetches_started(&self) -> u64 {
        self.counters.fetches.load(Ordering::Relaxed)
    }

    /// Total callers that joined a fetch already pending.
    pub fn joined(&self) -> u64 {
        self.counters.joined.load(Ordering::Relaxed)
    }

    async fn join_or_lead<F>(&self, key: &CacheKey, fetcher: F, options: &FetchOptions) -> ToolshedResult<CacheRead<V>>
    where
        F: Fetcher<V>,
    {
        // The shard lock is released before spawning so the leader task can
        // never contend with this caller for it.
        let (leader, rx) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(pending) => (None, pending.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());
                (Some(tx), rx)
            }
        };

        let source = match leader {
            Some(tx) => {
                self.spawn_fetch(key.clone(), fetcher, options.clone(), tx);
                ReadSource::Fetched
            }
            None => {
                self.counters.joined.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Joined pending fetch");
                ReadSource::Joined
            }
        };

        Self::await_settled(key, rx, source).await
    }

    fn spawn_fetch<F>(&self, key: CacheKey, fetcher: F, options: FetchOptions, tx: watch::Sender<Settled<V>>)
    where
        F: Fetcher<V>,
    {
        let guard = InFlightGuard::new(self.in_flight.clone(), key.clone());
        let store = self.store.clone();
        let ticket = store.ticket();
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            debug!(key = %key, "Fetching on miss");
            let result = fetcher.fetch().await;

            match &result {
                Ok(value) => {
                    store
                        .set_if_current(key.clone(), value.clone(), &options, ticket)
                        .await;
                }
                Err(e) => warn!(key = %key, error = %e, "Fetch failed, nothing cached"),
            }

            // Unregister before publishing: anyone who misses the pending
            // entry from here on finds the stored value instead.
            drop(guard);
            tx.send_replace(Some(result));
        });
    }

    async fn await_settled(
        key: &CacheKey,
        mut rx: watch::Receiver<Settled<V>>,
        source: ReadSource,
    ) -> ToolshedResult<CacheRead<V>> {
        let aborted = || -> ToolshedError {
            FetchError::Aborted {
                key: key.to_string(),
            }
            .into()
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(settled) => match &*settled {
                Some(Ok(value)) => Ok(CacheRead::from_fetch(value.clone(), source)),
                Some(Err(e)) => Err(e.clone()),
                None => Err(aborted()),
            },
            // Sender dropped without publishing: the fetch task panicked or
            // was cancelled with the runtime.
            Err(_) => Err(aborted()),
        };
        outcome
    }
}
