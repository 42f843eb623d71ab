//! Two-tier cache store.
//!
//! The memory tier is a bounded map evicted in insertion order. The optional
//! durable tier sits behind [`DurablePersistence`] and is strictly
//! best-effort: its failures are logged and degrade to a miss or a no-op.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use toolshed_core::{CacheConfig, Clock, SystemClock};
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, FetchOptions};
use super::key::{CacheKey, Invalidation, KeyPattern};
use super::persistence::{decode_entry, encode_entry};
use super::traits::{CacheValue, DurablePersistence};
use super::watermark::{InvalidationWatermark, WriteTicket};

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from either tier within the freshness window.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Reads served stale while a refresh ran.
    pub stale_hits: u64,
    /// Entries currently in the memory tier.
    pub entry_count: u64,
    /// Entries dropped from memory to stay within capacity.
    pub evictions: u64,
    /// Durable tier operations that failed or returned corrupt data.
    pub durable_errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Stale hits count as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    evictions: AtomicU64,
    durable_errors: AtomicU64,
}

struct Slot<V> {
    entry: CacheEntry<V>,
    seq: u64,
}

/// Bounded map plus an insertion-order queue.
///
/// The queue holds `(key, seq)` pairs; a pair is live only while the slot for
/// `key` still carries `seq`. Overwrites and removals leave dead pairs behind
/// that are skipped on eviction and compacted once they dominate the queue.
struct MemoryTier<V> {
    entries: HashMap<CacheKey, Slot<V>>,
    order: VecDeque<(CacheKey, u64)>,
    next_seq: u64,
}

impl<V> MemoryTier<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Insert or overwrite, returning the keys evicted to make room.
    fn insert(&mut self, entry: CacheEntry<V>, capacity: usize) -> Vec<CacheKey> {
        let key = entry.key().clone();
        let mut evicted = Vec::new();

        if !self.entries.contains_key(&key) {
            while self.entries.len() >= capacity {
                match self.pop_oldest() {
                    Some(old) => evicted.push(old),
                    None => break,
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((key.clone(), seq));
        self.entries.insert(key, Slot { entry, seq });
        self.compact();

        evicted
    }

    fn pop_oldest(&mut self) -> Option<CacheKey> {
        while let Some((key, seq)) = self.order.pop_front() {
            let live = self.entries.get(&key).is_some_and(|slot| slot.seq == seq);
            if live {
                self.entries.remove(&key);
                return Some(key);
            }
        }
        None
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let removed = self.entries.remove(key).map(|slot| slot.entry);
        self.compact();
        removed
    }

    fn retain_unexpired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.entry.is_expired(now));
        let purged = before - self.entries.len();
        self.compact();
        purged
    }

    fn compact(&mut self) {
        if self.order.len() <= self.entries.len() * 2 + 16 {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(key, seq)| entries.get(key).is_some_and(|slot| slot.seq == *seq));
    }
}

/// Two-tier key/value store with TTL and insertion-order eviction.
///
/// Values are cloned out on every read; the store keeps ownership.
pub struct CacheStore<V> {
    config: CacheConfig,
    memory: Mutex<MemoryTier<V>>,
    durable: Option<Arc<dyn DurablePersistence>>,
    clock: Arc<dyn Clock>,
    watermark: InvalidationWatermark,
    counters: StoreCounters,
}

impl<V: CacheValue> CacheStore<V> {
    /// Create a memory-only store.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            memory: Mutex::new(MemoryTier::new()),
            durable: None,
            clock: Arc::new(SystemClock),
            watermark: InvalidationWatermark::new(),
            counters: StoreCounters::default(),
        }
    }

    /// Attach a durable tier.
    pub fn with_persistence(mut self, durable: Arc<dyn DurablePersistence>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Replace the clock used for entry ages.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    /// Take a ticket for a write that starts now.
    pub fn ticket(&self) -> WriteTicket {
        self.watermark.ticket(self.clock.now())
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier<V>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a key, counting the result as a hit or miss.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let found = self.load(key).await;
        match found {
            Some(_) => self.record_hit(),
            None => self.record_miss(),
        }
        found
    }

    /// Look up a key without touching the hit/miss counters.
    ///
    /// Memory first, then the durable tier. Never returns an expired entry;
    /// expired entries found along the way are purged.
    pub(crate) async fn load(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let now = self.clock.now();
        {
            let mut memory = self.memory();
            if let Some(slot) = memory.entries.get(key) {
                if !slot.entry.is_expired(now) {
                    trace!(key = %key, "Memory tier hit");
                    return Some(slot.entry.clone());
                }
                memory.remove(key);
                trace!(key = %key, "Purged expired entry on read");
            }
        }

        let durable = self.durable.as_ref()?;
        let ticket = self.watermark.ticket(now);

        let record = match durable.get(key.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                self.counters.durable_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Durable tier read failed, treating as miss");
                return None;
            }
        };

        if record.is_expired(now) {
            self.delete_durable(key).await;
            return None;
        }

        let entry = match decode_entry::<V>(key, &record) {
            Ok(entry) if !entry.is_expired(now) => entry,
            Ok(_) => {
                self.delete_durable(key).await;
                return None;
            }
            Err(e) => {
                self.counters.durable_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Corrupt durable record, treating as miss");
                self.delete_durable(key).await;
                return None;
            }
        };

        // Promote unless an invalidation or a newer write got there first.
        {
            let mut memory = self.memory();
            if self.watermark.admits(key, &ticket) && !memory.entries.contains_key(key) {
                let evicted = memory.insert(entry.clone(), self.config.max_entries);
                self.note_evictions(&evicted);
                trace!(key = %key, "Promoted durable hit into memory");
            }
        }

        Some(entry)
    }

    /// Store a value unconditionally with `created_at = now`.
    pub async fn set(&self, key: CacheKey, value: V, options: &FetchOptions) {
        let entry = CacheEntry::from_options(key, value, self.clock.now(), options);
        {
            let mut memory = self.memory();
            let evicted = memory.insert(entry.clone(), self.config.max_entries);
            self.note_evictions(&evicted);
        }
        self.write_durable(&entry, options.persistent, None).await;
    }

    /// Store a value only if `ticket` is still current.
    ///
    /// The write is skipped when an invalidation covering `key` happened
    /// after the ticket was issued, or when the existing entry was written
    /// after it. Invalidations of other keys do not affect it. Returns
    /// whether the value was stored.
    pub async fn set_if_current(
        &self,
        key: CacheKey,
        value: V,
        options: &FetchOptions,
        ticket: WriteTicket,
    ) -> bool {
        let entry = CacheEntry::from_options(key, value, self.clock.now(), options);
        {
            let mut memory = self.memory();
            if !self.watermark.admits(entry.key(), &ticket) {
                debug!(key = %entry.key(), "Dropping write started before an invalidation");
                return false;
            }
            if let Some(slot) = memory.entries.get(entry.key()) {
                if ticket.is_superseded_by(slot.entry.created_at()) {
                    debug!(key = %entry.key(), "Dropping write older than the current entry");
                    return false;
                }
            }
            let evicted = memory.insert(entry.clone(), self.config.max_entries);
            self.note_evictions(&evicted);
        }
        self.write_durable(&entry, options.persistent, Some(ticket)).await;
        true
    }

    async fn write_durable(&self, entry: &CacheEntry<V>, persistent: bool, ticket: Option<WriteTicket>) {
        let Some(durable) = self.durable.as_ref() else {
            return;
        };

        if !persistent {
            // An older durable copy must not resurface after eviction.
            self.delete_durable(entry.key()).await;
            return;
        }

        let record = match encode_entry(entry) {
            Ok(record) => record,
            Err(e) => {
                self.counters.durable_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %entry.key(), error = %e, "Failed to encode entry for durable tier");
                return;
            }
        };

        if let Err(e) = durable.set(entry.key().as_str(), record).await {
            self.counters.durable_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %entry.key(), error = %e, "Durable tier write failed");
            return;
        }

        // An invalidation may have raced the write; undo it if so.
        if let Some(ticket) = ticket {
            if !self.watermark.admits(entry.key(), &ticket) {
                self.delete_durable(entry.key()).await;
            }
        }
    }

    async fn delete_durable(&self, key: &CacheKey) -> bool {
        let Some(durable) = self.durable.as_ref() else {
            return false;
        };
        match durable.delete(key.as_str()).await {
            Ok(removed) => removed,
            Err(e) => {
                self.counters.durable_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Durable tier delete failed");
                false
            }
        }
    }

    /// Remove one key from both tiers. Returns 1 if anything was removed.
    pub async fn invalidate(&self, key: &CacheKey) -> usize {
        let in_memory = {
            let mut memory = self.memory();
            self.watermark.advance(Invalidation::Key(key.clone()));
            memory.remove(key).is_some()
        };
        let in_durable = self.delete_durable(key).await;

        debug!(key = %key, removed = in_memory || in_durable, "Invalidated key");
        usize::from(in_memory || in_durable)
    }

    /// Remove every key matching `pattern` from both tiers.
    ///
    /// Returns the number of distinct keys removed; no match is not an error.
    pub async fn invalidate_matching(&self, pattern: &KeyPattern) -> usize {
        let mut removed: HashSet<String> = {
            let mut memory = self.memory();
            self.watermark.advance(Invalidation::Pattern(pattern.clone()));
            let matching: Vec<CacheKey> = memory
                .entries
                .keys()
                .filter(|key| pattern.matches(key.as_str()))
                .cloned()
                .collect();
            for key in &matching {
                memory.remove(key);
            }
            matching.into_iter().map(CacheKey::into_string).collect()
        };

        if let Some(durable) = self.durable.as_ref() {
            match durable.keys().await {
                Ok(keys) => {
                    for key in keys.into_iter().filter(|k| pattern.matches(k)) {
                        if self.delete_durable(&CacheKey::from_raw(key.clone())).await {
                            removed.insert(key);
                        }
                    }
                }
                Err(e) => {
                    self.counters.durable_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(pattern = pattern.as_str(), error = %e, "Failed to list durable keys");
                }
            }
        }

        debug!(pattern = pattern.as_str(), removed = removed.len(), "Invalidated pattern");
        removed.len()
    }

    /// Purge expired entries from both tiers. Returns the number purged.
    pub async fn sweep_expired(&self) -> u64 {
        let now = self.clock.now();
        let from_memory = self.memory().retain_unexpired(now) as u64;

        let from_durable = match self.durable.as_ref() {
            Some(durable) => match durable.purge_expired(now).await {
                Ok(purged) => purged,
                Err(e) => {
                    self.counters.durable_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Durable tier purge failed");
                    0
                }
            },
            None => 0,
        };

        if from_memory + from_durable > 0 {
            debug!(from_memory, from_durable, "Swept expired entries");
        }
        from_memory + from_durable
    }

    /// Number of entries in the memory tier.
    pub fn len(&self) -> usize {
        self.memory().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters. Has no side effects.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            durable_errors: self.counters.durable_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_hit(&self) {
        self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn note_evictions(&self, evicted: &[CacheKey]) {
        if evicted.is_empty() {
            return;
        }
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for key in evicted {
            trace!(key = %key, "Evicted oldest entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::persistence::InMemoryPersistence;
    use crate::cache::traits::PersistedRecord;
    use std::time::Duration;
    use toolshed_test_utils::ManualClock;

    fn opts(ttl_ms: u64) -> FetchOptions {
        FetchOptions::with_ttl(Duration::from_millis(ttl_ms))
    }

    fn store_with_clock(max_entries: usize) -> (CacheStore<String>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = CacheStore::new(CacheConfig::default().with_max_entries(max_entries))
            .with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    fn key(raw: &str) -> CacheKey {
        CacheKey::from(raw)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _clock) = store_with_clock(10);
        store.set(key("a"), "alpha".to_string(), &opts(1000)).await;

        let entry = store.get(&key("a")).await.unwrap();
        assert_eq!(entry.value(), "alpha");
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_purged_on_read() {
        let (store, clock) = store_with_clock(10);
        store.set(key("a"), "alpha".to_string(), &opts(1000)).await;

        clock.advance(Duration::from_millis(500));
        assert!(store.get(&key("a")).await.is_some());

        clock.advance(Duration::from_millis(1000));
        assert!(store.get(&key("a")).await.is_none());
        assert_eq!(store.len(), 0);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_eviction_is_insertion_ordered() {
        let (store, _clock) = store_with_clock(2);
        store.set(key("a"), "1".to_string(), &opts(1000)).await;
        store.set(key("b"), "2".to_string(), &opts(1000)).await;

        // Reading does not refresh position.
        assert!(store.get(&key("a")).await.is_some());

        store.set(key("c"), "3".to_string(), &opts(1000)).await;
        assert!(store.get(&key("a")).await.is_none());
        assert!(store.get(&key("b")).await.is_some());
        assert!(store.get(&key("c")).await.is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_moves_key_to_back() {
        let (store, _clock) = store_with_clock(2);
        store.set(key("a"), "1".to_string(), &opts(1000)).await;
        store.set(key("b"), "2".to_string(), &opts(1000)).await;
        store.set(key("a"), "1b".to_string(), &opts(1000)).await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.stats().evictions, 0);

        store.set(key("c"), "3".to_string(), &opts(1000)).await;
        assert!(store.get(&key("b")).await.is_none());
        assert_eq!(store.get(&key("a")).await.unwrap().value(), "1b");
    }

    #[tokio::test]
    async fn test_order_queue_stays_bounded_under_overwrites() {
        let (store, _clock) = store_with_clock(4);
        for i in 0..1000 {
            store.set(key("hot"), i.to_string(), &opts(1000)).await;
        }
        let memory = store.memory();
        assert_eq!(memory.entries.len(), 1);
        assert!(memory.order.len() <= 18);
    }

    #[tokio::test]
    async fn test_invalidate_exact() {
        let (store, _clock) = store_with_clock(10);
        store.set(key("a"), "1".to_string(), &opts(1000)).await;
        assert_eq!(store.invalidate(&key("a")).await, 1);
        assert_eq!(store.invalidate(&key("a")).await, 0);
        assert!(store.get(&key("a")).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_matching() {
        let (store, _clock) = store_with_clock(10);
        store.set(key("tools:{}"), "t".to_string(), &opts(1000)).await;
        store.set(key(r#"tools:{"page":2}"#), "t2".to_string(), &opts(1000)).await;
        store.set(key("categories:{}"), "c".to_string(), &opts(1000)).await;

        let pattern = KeyPattern::new("tools:*").unwrap();
        assert_eq!(store.invalidate_matching(&pattern).await, 2);
        assert!(store.get(&key("categories:{}")).await.is_some());
        assert_eq!(store.len(), 1);

        let none = KeyPattern::new("nothing:*").unwrap();
        assert_eq!(store.invalidate_matching(&none).await, 0);
    }

    #[tokio::test]
    async fn test_set_if_current_rejects_after_invalidation() {
        let (store, _clock) = store_with_clock(10);
        let ticket = store.ticket();
        store.invalidate(&key("a")).await;

        let stored = store
            .set_if_current(key("a"), "late".to_string(), &opts(1000), ticket)
            .await;
        assert!(!stored);
        assert!(store.get(&key("a")).await.is_none());
    }

    #[tokio::test]
    async fn test_set_if_current_ignores_other_invalidations() {
        let (store, _clock) = store_with_clock(10);
        store.set(key("categories:{}"), "c".to_string(), &opts(1000)).await;
        let ticket = store.ticket();

        store.invalidate(&key("categories:{}")).await;
        let nothing = KeyPattern::new("reviews:*").unwrap();
        assert_eq!(store.invalidate_matching(&nothing).await, 0);

        assert!(
            store
                .set_if_current(key("tools:{}"), "t".to_string(), &opts(1000), ticket)
                .await
        );
        assert_eq!(store.get(&key("tools:{}")).await.unwrap().value(), "t");
    }

    #[tokio::test]
    async fn test_set_if_current_rejects_after_matching_pattern() {
        let (store, _clock) = store_with_clock(10);
        let ticket = store.ticket();
        let pattern = KeyPattern::new("tools:*").unwrap();
        assert_eq!(store.invalidate_matching(&pattern).await, 0);

        let stored = store
            .set_if_current(key("tools:{}"), "late".to_string(), &opts(1000), ticket)
            .await;
        assert!(!stored);
    }

    #[tokio::test]
    async fn test_set_if_current_rejects_older_than_existing() {
        let (store, clock) = store_with_clock(10);
        let ticket = store.ticket();

        clock.advance(Duration::from_millis(10));
        store.set(key("a"), "newer".to_string(), &opts(1000)).await;

        let stored = store
            .set_if_current(key("a"), "older".to_string(), &opts(1000), ticket)
            .await;
        assert!(!stored);
        assert_eq!(store.get(&key("a")).await.unwrap().value(), "newer");
    }

    #[tokio::test]
    async fn test_set_if_current_replaces_entry_it_refreshes() {
        let (store, clock) = store_with_clock(10);
        store.set(key("a"), "v1".to_string(), &opts(1000)).await;

        clock.advance(Duration::from_millis(300));
        let ticket = store.ticket();
        assert!(
            store
                .set_if_current(key("a"), "v2".to_string(), &opts(1000), ticket)
                .await
        );

        let entry = store.get(&key("a")).await.unwrap();
        assert_eq!(entry.value(), "v2");
        assert_eq!(entry.created_at(), clock.now());
    }

    #[tokio::test]
    async fn test_sweep_expired_memory() {
        let (store, clock) = store_with_clock(10);
        store.set(key("short"), "s".to_string(), &opts(100)).await;
        store.set(key("long"), "l".to_string(), &opts(10_000)).await;

        clock.advance(Duration::from_millis(200));
        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_durable_tier_survives_new_store() {
        let durable = Arc::new(InMemoryPersistence::new());
        let clock = ManualClock::starting_now();

        let first: CacheStore<String> = CacheStore::new(CacheConfig::default())
            .with_persistence(durable.clone())
            .with_clock(Arc::new(clock.clone()));
        first
            .set(key("a"), "kept".to_string(), &opts(1000).persistent(true))
            .await;
        drop(first);

        let second: CacheStore<String> = CacheStore::new(CacheConfig::default())
            .with_persistence(durable.clone())
            .with_clock(Arc::new(clock.clone()));
        assert_eq!(second.len(), 0);
        assert_eq!(second.get(&key("a")).await.unwrap().value(), "kept");
        assert_eq!(second.len(), 1, "durable hit is promoted");
    }

    #[tokio::test]
    async fn test_durable_expiry_is_independent() {
        let durable = Arc::new(InMemoryPersistence::new());
        let clock = ManualClock::starting_now();
        let store: CacheStore<String> = CacheStore::new(CacheConfig::default())
            .with_persistence(durable.clone())
            .with_clock(Arc::new(clock.clone()));

        store
            .set(key("a"), "v".to_string(), &opts(1000).persistent(true))
            .await;

        clock.advance(Duration::from_millis(1500));
        assert_eq!(store.sweep_expired().await, 2);
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_durable_record_is_a_miss() {
        let durable = Arc::new(InMemoryPersistence::new());
        durable
            .set(
                "a",
                PersistedRecord::new(b"garbage".to_vec(), Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        let store: CacheStore<String> =
            CacheStore::new(CacheConfig::default()).with_persistence(durable.clone());
        assert!(store.get(&key("a")).await.is_none());
        assert_eq!(store.stats().durable_errors, 1);
        assert!(durable.is_empty(), "corrupt record is deleted");
    }

    #[tokio::test]
    async fn test_non_persistent_write_drops_durable_copy() {
        let durable = Arc::new(InMemoryPersistence::new());
        let store: CacheStore<String> =
            CacheStore::new(CacheConfig::default()).with_persistence(durable.clone());

        store
            .set(key("a"), "old".to_string(), &opts(1000).persistent(true))
            .await;
        assert_eq!(durable.len(), 1);

        store.set(key("a"), "new".to_string(), &opts(1000)).await;
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_matching_reaches_durable_tier() {
        let durable = Arc::new(InMemoryPersistence::new());
        let store: CacheStore<String> = CacheStore::new(CacheConfig::default().with_max_entries(1))
            .with_persistence(durable.clone());

        let persistent = opts(1000).persistent(true);
        store.set(key("tools:{}"), "a".to_string(), &persistent).await;
        // Evicts tools:{} from memory; the durable copy remains.
        store.set(key(r#"tools:{"page":2}"#), "b".to_string(), &persistent).await;
        store.set(key("categories:{}"), "c".to_string(), &persistent).await;

        let pattern = KeyPattern::new("tools:*").unwrap();
        assert_eq!(store.invalidate_matching(&pattern).await, 2);
        assert_eq!(durable.keys().await.unwrap(), vec!["categories:{}".to_string()]);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 6,
            stale_hits: 2,
            misses: 2,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
