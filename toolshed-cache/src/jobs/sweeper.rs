//! Expired Entry Sweeper
//!
//! Reads already treat expired entries as misses, so sweeping is purely a
//! memory and disk reclamation pass. Entries that nobody reads again would
//! otherwise sit in the memory tier until evicted and in the durable tier
//! forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::{CacheStore, CacheValue};

/// Counters for sweep activity.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Sweep cycles completed
    pub cycles: AtomicU64,

    /// Entries purged across both tiers
    pub purged: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub cycles: u64,
    pub purged: u64,
}

/// Background task that periodically purges expired entries.
///
/// The first sweep runs immediately. Runs until `true` is sent on
/// `shutdown_rx` or the sender is dropped, then returns the metrics it
/// collected.
pub async fn sweep_task<V: CacheValue>(
    store: Arc<CacheStore<V>>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics> {
    let metrics = Arc::new(SweepMetrics::new());

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = every.as_millis() as u64, "Cache sweeper started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let purged = store.sweep_expired().await;
                metrics.cycles.fetch_add(1, Ordering::Relaxed);
                metrics.purged.fetch_add(purged, Ordering::Relaxed);
                tracing::trace!(purged, "Sweep cycle complete");
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        purged = snapshot.purged,
        "Cache sweeper completed"
    );

    metrics
}
