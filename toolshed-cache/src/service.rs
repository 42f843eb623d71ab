//! Cache Service
//!
//! `CacheService` is the single surface request handlers use. It composes
//! the read-through coordinator (which owns the store and the refresh
//! scheduler), the counter write coalescer and the optional sweeper job.
//!
//! There is no process-wide instance: build one at startup, share it behind
//! an `Arc`, and call [`CacheService::shutdown`] before exit so pending
//! increments are drained.
//!
//! # Usage
//!
//! ```ignore
//! let service = CacheService::builder(CacheConfig::from_env(), counters)
//!     .coalescer_config(CoalescerConfig::from_env())
//!     .build()?;
//! service.spawn_sweeper();
//!
//! let key = CacheKey::encode_params("tools", &filters)?;
//! let listing = service
//!     .fetch_with_cache(&key, move || list_tools(filters.clone()), &service.options())
//!     .await?;
//!
//! service.record_increment(&tool_id, 1);
//! service.invalidate(&key).await;
//! service.invalidate_pattern("tools:*").await?;
//!
//! service.shutdown().await;
//! ```

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use toolshed_core::{CacheConfig, Clock, CoalescerConfig, ToolshedResult};
use tracing::{info, warn};

use crate::cache::{
    CacheKey, CacheRead, CacheStore, CacheValue, DurablePersistence, FetchOptions, Fetcher,
    Invalidation, LmdbPersistence, RequestCoordinator,
};
use crate::coalescer::{CounterStore, DeadLetter, FlushReport, WriteCoalescer};
use crate::jobs::{sweep_task, SweepMetrics};

/// Point-in-time view of the whole cache layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheServiceStats {
    /// Entries held in the memory tier
    pub entry_count: u64,
    /// Singleflight fetches not yet settled
    pub pending_fetches: usize,
    /// Background refreshes not yet settled
    pub pending_refreshes: usize,
    /// Targets with an undelivered counter delta
    pub pending_increments: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub evictions: u64,
    pub dead_lettered: usize,
}

struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Arc<SweepMetrics>>,
}

/// Builder for [`CacheService`].
pub struct CacheServiceBuilder<V, C> {
    cache_config: CacheConfig,
    coalescer_config: CoalescerConfig,
    counters: Arc<C>,
    durable: Option<Arc<dyn DurablePersistence>>,
    clock: Option<Arc<dyn Clock>>,
    _value: PhantomData<fn() -> V>,
}

impl<V: CacheValue, C: CounterStore> CacheServiceBuilder<V, C> {
    pub fn coalescer_config(mut self, config: CoalescerConfig) -> Self {
        self.coalescer_config = config;
        self
    }

    /// Use `durable` as the second tier instead of opening LMDB at
    /// `CacheConfig::durable_path`.
    pub fn with_persistence(mut self, durable: Arc<dyn DurablePersistence>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate both configs, open the durable tier if one is configured and
    /// start the coalescer timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> ToolshedResult<CacheService<V, C>> {
        self.cache_config.validate()?;
        self.coalescer_config.validate()?;

        let durable = match (self.durable, self.cache_config.durable_path.as_ref()) {
            (Some(durable), _) => Some(durable),
            (None, Some(path)) => {
                let lmdb = LmdbPersistence::open(path, self.cache_config.durable_max_size_mb)?;
                Some(Arc::new(lmdb) as Arc<dyn DurablePersistence>)
            }
            (None, None) => None,
        };

        let mut store = CacheStore::new(self.cache_config);
        if let Some(durable) = durable {
            store = store.with_persistence(durable);
        }
        if let Some(clock) = self.clock {
            store = store.with_clock(clock);
        }
        let store = Arc::new(store);

        info!(
            max_entries = store.config().max_entries,
            durable = store.has_durable_tier(),
            "Cache service started"
        );

        Ok(CacheService {
            coordinator: Arc::new(RequestCoordinator::new(store)),
            coalescer: WriteCoalescer::new(self.counters, self.coalescer_config),
            sweeper: Mutex::new(None),
        })
    }
}

/// Read-through cache plus counter write coalescing behind one handle.
pub struct CacheService<V: CacheValue, C: CounterStore> {
    coordinator: Arc<RequestCoordinator<V>>,
    coalescer: WriteCoalescer<C>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<V: CacheValue, C: CounterStore> CacheService<V, C> {
    pub fn builder(config: CacheConfig, counters: Arc<C>) -> CacheServiceBuilder<V, C> {
        CacheServiceBuilder {
            cache_config: config,
            coalescer_config: CoalescerConfig::default(),
            counters,
            durable: None,
            clock: None,
            _value: PhantomData,
        }
    }

    /// Build a service with default wiring.
    pub fn new(
        config: CacheConfig,
        counters: Arc<C>,
        coalescer_config: CoalescerConfig,
    ) -> ToolshedResult<Self> {
        Self::builder(config, counters)
            .coalescer_config(coalescer_config)
            .build()
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &RequestCoordinator<V> {
        &self.coordinator
    }

    pub fn coalescer(&self) -> &WriteCoalescer<C> {
        &self.coalescer
    }

    /// Fetch options derived from the configured defaults.
    pub fn options(&self) -> FetchOptions {
        FetchOptions::from_config(self.store().config())
    }

    /// Return the cached value for `key`, fetching it on miss.
    ///
    /// Concurrent misses on one key share a single fetch. Stale entries are
    /// served immediately when `stale_while_revalidate` is set. Fetch errors
    /// are returned to every waiting caller and never cached.
    pub async fn fetch_with_cache<F>(
        &self,
        key: &CacheKey,
        fetcher: F,
        options: &FetchOptions,
    ) -> ToolshedResult<V>
    where
        F: Fetcher<V>,
    {
        self.coordinator.fetch(key, fetcher, options).await
    }

    /// Like [`fetch_with_cache`](Self::fetch_with_cache), with read metadata.
    pub async fn fetch_read<F>(
        &self,
        key: &CacheKey,
        fetcher: F,
        options: &FetchOptions,
    ) -> ToolshedResult<CacheRead<V>>
    where
        F: Fetcher<V>,
    {
        self.coordinator.fetch_read(key, fetcher, options).await
    }

    /// Warm `key` in the background of a request. Returns `false` when the
    /// entry was already fresh.
    pub async fn prefetch<F>(
        &self,
        key: &CacheKey,
        fetcher: F,
        options: &FetchOptions,
    ) -> ToolshedResult<bool>
    where
        F: Fetcher<V>,
    {
        self.coordinator.prefetch(key, fetcher, options).await
    }

    /// Remove an exact key, or every key matching a pattern, from both
    /// tiers. Returns the number of keys removed.
    ///
    /// A `&CacheKey` is always exact, even when its parameters contain `*`.
    pub async fn invalidate(&self, target: impl Into<Invalidation>) -> usize {
        match target.into() {
            Invalidation::Key(key) => self.store().invalidate(&key).await,
            Invalidation::Pattern(pattern) => self.store().invalidate_matching(&pattern).await,
        }
    }

    /// Compile a `*` pattern such as `tools:*` and invalidate every match.
    pub async fn invalidate_pattern(&self, pattern: &str) -> ToolshedResult<usize> {
        let target = Invalidation::pattern(pattern)?;
        Ok(self.invalidate(target).await)
    }

    pub fn record_increment(&self, target_id: &str, delta: i64) {
        self.coalescer.record_increment(target_id, delta);
    }

    pub fn record_increment_with_delay(&self, target_id: &str, delta: i64, delay: std::time::Duration) {
        self.coalescer.record_increment_with_delay(target_id, delta, delay);
    }

    /// Flush every pending increment now.
    pub async fn flush_now(&self) -> FlushReport {
        self.coalescer.flush_now().await
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.coalescer.dead_letters()
    }

    pub fn requeue_dead_letters(&self) -> usize {
        self.coalescer.requeue_dead_letters()
    }

    pub fn stats(&self) -> CacheServiceStats {
        let cache = self.store().stats();
        let writes = self.coalescer.stats();
        CacheServiceStats {
            entry_count: cache.entry_count,
            pending_fetches: self.coordinator.pending(),
            pending_refreshes: self.coordinator.refresher().in_flight(),
            pending_increments: writes.pending_targets,
            hits: cache.hits,
            misses: cache.misses,
            stale_hits: cache.stale_hits,
            evictions: cache.evictions,
            dead_lettered: writes.dead_lettered,
        }
    }

    /// Start the expiry sweeper at `CacheConfig::sweep_interval`.
    ///
    /// Returns `false` if it is already running.
    pub fn spawn_sweeper(&self) -> bool {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let every = self.store().config().sweep_interval;
        let task = tokio::spawn(sweep_task(self.store().clone(), every, shutdown_rx));
        *slot = Some(SweeperHandle { shutdown_tx, task });
        true
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the sweeper and drain the coalescer.
    ///
    /// Safe to call more than once; later calls only flush whatever was
    /// recorded in between.
    pub async fn shutdown(&self) -> FlushReport {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(SweeperHandle { shutdown_tx, task }) = sweeper {
            let _ = shutdown_tx.send(true);
            if let Err(e) = task.await {
                warn!(error = %e, "Cache sweeper ended abnormally");
            }
        }

        let report = self.coalescer.shutdown().await;
        let stats = self.stats();
        info!(
            entry_count = stats.entry_count,
            hits = stats.hits,
            misses = stats.misses,
            dead_lettered = stats.dead_lettered,
            "Cache service stopped"
        );
        report
    }
}
