//! Counter write coalescing.
//!
//! High-frequency increments (view counts) are summed per target in memory
//! and written to the [`CounterStore`] in batches. A single debounce deadline
//! per coalescer decides when the next batch goes out: every increment pushes
//! it `delay` into the future, but never past `max_delay` after the first
//! increment of the batch.
//!
//! # Failure handling
//!
//! A failed write is merged back into the live delta for its target, so
//! nothing is lost and nothing is counted twice. The target then backs off
//! exponentially. After `max_attempts` consecutive failures the delta moves
//! to a dead-letter ledger that operators can inspect and requeue.
//!
//! # Example
//!
//! ```ignore
//! let coalescer = WriteCoalescer::new(Arc::new(db), CoalescerConfig::from_env());
//! coalescer.record_increment("tool-42", 1);
//! // ... on shutdown
//! let report = coalescer.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use toolshed_core::{CoalescerConfig, ToolshedResult};
use tracing::{debug, error, info, trace, warn};

/// Backend that receives coalesced counter writes.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Add `amount` to the counter of `target_id`.
    async fn increment(&self, target_id: &str, amount: i64) -> ToolshedResult<()>;
}

/// Lifecycle of the coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescerState {
    /// Nothing pending and no flush running.
    Idle,
    /// Increments are waiting for the next flush.
    Accumulating,
    /// A flush is writing to the backend.
    Flushing,
}

/// Outcome of one flush, counted in targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed writes, dead-lettered ones included.
    pub failed: usize,
    pub dead_lettered: usize,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// A delta that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub target_id: String,
    pub delta: i64,
    pub failures: u32,
    pub last_error: String,
}

/// Point-in-time view of the coalescer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    pub pending_targets: usize,
    pub pending_delta: i64,
    pub flushes: u64,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
    /// Targets currently held in the dead-letter ledger.
    pub dead_lettered: usize,
}

#[derive(Debug, Default)]
struct CoalescerMetrics {
    flushes: AtomicU64,
    writes_succeeded: AtomicU64,
    writes_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    failures: u32,
    not_before: Instant,
}

#[derive(Debug, Default)]
struct Accumulator {
    pending: HashMap<String, i64>,
    retry: HashMap<String, RetryState>,
    dead_letters: HashMap<String, DeadLetter>,
    deadline: Option<Instant>,
    batch_started: Option<Instant>,
    flushes_in_progress: usize,
}

impl Accumulator {
    fn add(&mut self, target_id: &str, delta: i64) {
        let slot = self.pending.entry(target_id.to_string()).or_insert(0);
        *slot = slot.saturating_add(delta);
    }

    /// Push the deadline to `now + delay`, capped by the batch's max delay.
    fn debounce(&mut self, now: Instant, delay: Duration, max_delay: Duration) {
        let started = *self.batch_started.get_or_insert(now);
        self.deadline = Some((now + delay).min(started + max_delay));
    }

    /// Make sure anything left pending has a deadline to flush at.
    fn reschedule(&mut self, now: Instant, delay: Duration) {
        if self.pending.is_empty() {
            self.deadline = None;
            self.batch_started = None;
            return;
        }

        let earliest = self
            .pending
            .keys()
            .map(|target| match self.retry.get(target) {
                Some(retry) => retry.not_before,
                None => now + delay,
            })
            .min();

        self.deadline = match (self.deadline, earliest) {
            (Some(current), Some(earliest)) => Some(current.min(earliest)),
            (current, earliest) => current.or(earliest),
        };
        self.batch_started.get_or_insert(now);
    }
}

struct Shared<C> {
    store: Arc<C>,
    config: CoalescerConfig,
    state: Mutex<Accumulator>,
    wake: Notify,
    metrics: CoalescerMetrics,
}

impl<C: CounterStore> Shared<C> {
    fn state(&self) -> MutexGuard<'_, Accumulator> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot-and-clear every flushable target, then write the batch.
    async fn flush(self: &Arc<Self>, force: bool) -> FlushReport {
        let now = Instant::now();
        let batch: Vec<(String, i64)> = {
            let mut guard = self.state();
            let acc = &mut *guard;
            let retry = &acc.retry;
            let mut batch = Vec::new();

            acc.pending.retain(|target, delta| {
                let backing_off = retry.get(target).is_some_and(|r| r.not_before > now);
                if backing_off && !force {
                    return true;
                }
                if *delta != 0 {
                    batch.push((target.clone(), *delta));
                }
                false
            });

            acc.deadline = None;
            acc.batch_started = None;
            acc.reschedule(now, self.config.delay);
            if !batch.is_empty() {
                acc.flushes_in_progress += 1;
            }
            batch
        };

        if batch.is_empty() {
            trace!("Flush found nothing to write");
            return FlushReport::default();
        }

        // The writes run on their own task so a caller that stops waiting
        // cannot lose a snapshot that was already taken.
        let shared = Arc::clone(self);
        let attempted = batch.len();
        match tokio::spawn(async move { shared.write_batch(batch).await }).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, targets = attempted, "Flush task aborted");
                FlushReport {
                    attempted,
                    failed: attempted,
                    ..Default::default()
                }
            }
        }
    }

    async fn write_batch(&self, batch: Vec<(String, i64)>) -> FlushReport {
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(targets = batch.len(), "Flushing coalesced increments");

        let writes = batch.iter().map(|(target, delta)| {
            let store = Arc::clone(&self.store);
            let target = target.clone();
            let delta = *delta;
            tokio::spawn(async move { store.increment(&target, delta).await })
        });
        let outcomes = join_all(writes).await;

        let mut report = FlushReport {
            attempted: batch.len(),
            ..Default::default()
        };
        let now = Instant::now();
        {
            let mut acc = self.state();
            for ((target, delta), outcome) in batch.into_iter().zip(outcomes) {
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(format!("increment task failed: {}", e)),
                };

                match failure {
                    None => {
                        acc.retry.remove(&target);
                        report.succeeded += 1;
                        self.metrics.writes_succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(reason) => {
                        report.failed += 1;
                        self.metrics.writes_failed.fetch_add(1, Ordering::Relaxed);
                        if self.requeue_failed(&mut acc, target, delta, reason, now) {
                            report.dead_lettered += 1;
                        }
                    }
                }
            }
            acc.flushes_in_progress = acc.flushes_in_progress.saturating_sub(1);
            acc.reschedule(now, self.config.delay);
        }
        self.wake.notify_one();

        if report.failed > 0 {
            warn!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "Flush completed with failures"
            );
        } else {
            debug!(succeeded = report.succeeded, "Flush completed");
        }
        report
    }

    /// Merge a failed delta back, or dead-letter it. Returns true if
    /// dead-lettered.
    fn requeue_failed(
        &self,
        acc: &mut Accumulator,
        target: String,
        delta: i64,
        reason: String,
        now: Instant,
    ) -> bool {
        let failures = acc.retry.get(&target).map_or(0, |r| r.failures) + 1;

        if failures >= self.config.max_attempts {
            acc.retry.remove(&target);
            error!(
                target_id = %target,
                delta,
                failures,
                error = %reason,
                "Dead-lettering increment after repeated failures"
            );
            let letter = acc
                .dead_letters
                .entry(target.clone())
                .or_insert_with(|| DeadLetter {
                    target_id: target,
                    delta: 0,
                    failures: 0,
                    last_error: String::new(),
                });
            letter.delta = letter.delta.saturating_add(delta);
            letter.failures = failures;
            letter.last_error = reason;
            return true;
        }

        let backoff = self.config.backoff_for(failures);
        warn!(
            target_id = %target,
            delta,
            failures,
            backoff_ms = backoff.as_millis() as u64,
            error = %reason,
            "Increment failed, requeued"
        );
        acc.add(&target, delta);
        acc.retry.insert(
            target,
            RetryState {
                failures,
                not_before: now + backoff,
            },
        );
        false
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Single debounce timer per coalescer.
async fn timer_task<C: CounterStore>(shared: Arc<Shared<C>>, mut shutdown_rx: watch::Receiver<bool>) {
    debug!("Coalescer timer started");
    loop {
        let deadline = shared.state().deadline;
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            // Deadline moved; re-read it.
            _ = shared.wake.notified() => {}
            _ = wait_until(deadline) => {
                shared.flush(false).await;
            }
        }
    }
    debug!("Coalescer timer stopped");
}

/// Debounced batcher of counter increments.
pub struct WriteCoalescer<C: CounterStore> {
    shared: Arc<Shared<C>>,
    shutdown_tx: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<C: CounterStore> WriteCoalescer<C> {
    /// Create a coalescer and start its timer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(store: Arc<C>, config: CoalescerConfig) -> Self {
        let shared = Arc::new(Shared {
            store,
            config,
            state: Mutex::new(Accumulator::default()),
            wake: Notify::new(),
            metrics: CoalescerMetrics::default(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = tokio::spawn(timer_task(Arc::clone(&shared), shutdown_rx));

        Self {
            shared,
            shutdown_tx,
            timer: Mutex::new(Some(timer)),
        }
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.shared.config
    }

    /// Add `delta` to `target_id` using the configured debounce delay.
    pub fn record_increment(&self, target_id: &str, delta: i64) {
        self.record_increment_with_delay(target_id, delta, self.shared.config.delay);
    }

    /// Add `delta` to `target_id` and push the flush deadline `delay` out.
    ///
    /// Never suspends. The deadline never moves past `max_delay` after the
    /// first increment of the current batch.
    pub fn record_increment_with_delay(&self, target_id: &str, delta: i64, delay: Duration) {
        let now = Instant::now();
        {
            let mut acc = self.shared.state();
            acc.add(target_id, delta);
            acc.debounce(now, delay, self.shared.config.max_delay);
        }
        self.shared.wake.notify_one();
        trace!(target_id, delta, "Recorded increment");
    }

    /// Flush every pending target immediately, ignoring retry backoff.
    pub async fn flush_now(&self) -> FlushReport {
        self.shared.flush(true).await
    }

    /// Flush the targets that are not backing off, as the timer would.
    pub async fn flush(&self) -> FlushReport {
        self.shared.flush(false).await
    }

    pub fn state(&self) -> CoalescerState {
        let acc = self.shared.state();
        if acc.flushes_in_progress > 0 {
            CoalescerState::Flushing
        } else if !acc.pending.is_empty() {
            CoalescerState::Accumulating
        } else {
            CoalescerState::Idle
        }
    }

    /// Live pending delta for one target.
    pub fn pending_delta(&self, target_id: &str) -> i64 {
        self.shared.state().pending.get(target_id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> CoalescerStats {
        let acc = self.shared.state();
        CoalescerStats {
            pending_targets: acc.pending.len(),
            pending_delta: acc.pending.values().fold(0i64, |sum, d| sum.saturating_add(*d)),
            flushes: self.shared.metrics.flushes.load(Ordering::Relaxed),
            writes_succeeded: self.shared.metrics.writes_succeeded.load(Ordering::Relaxed),
            writes_failed: self.shared.metrics.writes_failed.load(Ordering::Relaxed),
            dead_lettered: acc.dead_letters.len(),
        }
    }

    /// Contents of the dead-letter ledger, ordered by target.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = self.shared.state().dead_letters.values().cloned().collect();
        letters.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        letters
    }

    /// Move every dead-lettered delta back into the live map for another
    /// round of attempts. Returns the number of targets requeued.
    pub fn requeue_dead_letters(&self) -> usize {
        let now = Instant::now();
        let requeued = {
            let mut acc = self.shared.state();
            let letters: Vec<DeadLetter> = acc.dead_letters.drain().map(|(_, l)| l).collect();
            for letter in &letters {
                acc.add(&letter.target_id, letter.delta);
            }
            if !letters.is_empty() {
                acc.debounce(now, self.shared.config.delay, self.shared.config.max_delay);
            }
            letters.len()
        };
        if requeued > 0 {
            self.shared.wake.notify_one();
            info!(targets = requeued, "Requeued dead-lettered increments");
        }
        requeued
    }

    /// Stop the timer and drain everything still pending.
    pub async fn shutdown(&self) -> FlushReport {
        let _ = self.shutdown_tx.send(true);
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "Coalescer timer ended abnormally");
            }
        }

        let report = self.flush_now().await;
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Coalescer drained"
        );
        report
    }
}

impl<C: CounterStore> Drop for WriteCoalescer<C> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let pending = self.shared.state().pending.len();
        if pending > 0 {
            warn!(pending_targets = pending, "Coalescer dropped with undelivered increments");
        }
    }
}


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
