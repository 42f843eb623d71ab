//! Toolshed Test Utilities
//!
//! Shared test infrastructure for the Toolshed workspace:
//! - A manual clock for driving entry ages
//! - Scriptable fetchers, counter stores and durable tiers
//! - Proptest generators for keys, params and increment streams
//! - Fixtures for directory listings and fast test configs
//! - Custom assertions for Toolshed error variants

pub use toolshed_cache::{
    CacheKey, CacheService, CounterStore, DurablePersistence, Fetcher, InMemoryPersistence,
    PersistedRecord,
};
pub use toolshed_core::{
    CacheConfig, Clock, CoalescerConfig, FetchError, PersistenceError, ToolshedError,
    ToolshedResult,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

// ============================================================================
// CLOCK
// ============================================================================

/// Clock that only moves when told to.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).expect("advance fits in chrono::Duration");
        *self.now.write().unwrap() += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap()
    }
}

// ============================================================================
// FETCHERS
// ============================================================================

/// Fetcher that counts invocations and returns a replaceable value.
///
/// Clones share the call counter, the value and the failure budget, so a
/// test can keep one handle for assertions and hand clones to the cache.
#[derive(Clone)]
pub struct CountingFetcher<V> {
    key: String,
    value: Arc<Mutex<V>>,
    calls: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl<V: Clone + Send + Sync + 'static> CountingFetcher<V> {
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value: Arc::new(Mutex::new(value)),
            calls: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(0)),
            latency: None,
        }
    }

    /// Sleep for `latency` (tokio time) before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `times` calls with `FetchError::Failed`.
    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    /// Replace the value returned by subsequent calls.
    pub fn set_value(&self, value: V) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Fetcher<V> for CountingFetcher<V> {
    async fn fetch(&self) -> ToolshedResult<V> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ToolshedError::fetch_failed(self.key.clone(), "scripted failure"));
        }

        Ok(self.value.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Fetcher that blocks every call until the test releases it.
///
/// Releases are permits, so releasing before a call arrives is not lost.
#[derive(Clone)]
pub struct GatedFetcher<V> {
    key: String,
    value: V,
    calls: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
}

impl<V: Clone + Send + Sync + 'static> GatedFetcher<V> {
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `n` pending or future calls complete.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Make every pending and future call fail with `FetchError::Aborted`.
    pub fn abort(&self) {
        self.gate.close();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Yield until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Fetcher<V> for GatedFetcher<V> {
    async fn fetch(&self) -> ToolshedResult<V> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.gate.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(self.value.clone())
            }
            Err(_) => Err(FetchError::Aborted {
                key: self.key.clone(),
            }
            .into()),
        }
    }
}

// ============================================================================
// COUNTER STORE
// ============================================================================

/// In-memory counter table that records every write and can be scripted to
/// fail per target.
#[derive(Debug, Default)]
pub struct RecordingCounterStore {
    totals: DashMap<String, i64>,
    writes: Mutex<Vec<(String, i64)>>,
    attempts: AtomicUsize,
    /// Remaining failures per target; `None` fails until healed.
    failing: DashMap<String, Option<u32>>,
}

impl RecordingCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write to `target_id` until [`heal`](Self::heal) is called.
    pub fn fail_target(&self, target_id: &str) {
        self.failing.insert(target_id.to_string(), None);
    }

    /// Fail the next `times` writes to `target_id`.
    pub fn fail_times(&self, target_id: &str, times: u32) {
        self.failing.insert(target_id.to_string(), Some(times));
    }

    pub fn heal(&self, target_id: &str) {
        self.failing.remove(target_id);
    }

    /// Sum of successful writes to `target_id`.
    pub fn total(&self, target_id: &str) -> i64 {
        self.totals.get(target_id).map(|t| *t).unwrap_or(0)
    }

    /// Sum of successful writes across every target.
    pub fn grand_total(&self) -> i64 {
        self.totals.iter().map(|t| *t.value()).sum()
    }

    /// Successful writes in the order they landed.
    pub fn writes(&self) -> Vec<(String, i64)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Successful writes sorted by target, for order-insensitive assertions.
    pub fn sorted_writes(&self) -> Vec<(String, i64)> {
        let mut writes = self.writes();
        writes.sort();
        writes
    }

    /// Every call to `increment`, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self, target_id: &str) -> bool {
        let Some(mut budget) = self.failing.get_mut(target_id) else {
            return false;
        };
        match budget.value_mut() {
            None => true,
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            Some(_) => false,
        }
    }
}

#[async_trait]
impl CounterStore for RecordingCounterStore {
    async fn increment(&self, target_id: &str, amount: i64) -> ToolshedResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(target_id) {
            return Err(ToolshedError::write_failed(target_id, "scripted failure"));
        }

        *self.totals.entry(target_id.to_string()).or_insert(0) += amount;
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((target_id.to_string(), amount));
        Ok(())
    }
}

// ============================================================================
// DURABLE TIER
// ============================================================================

/// In-memory durable tier that can be switched into a failing mode or
/// seeded with corrupt records.
#[derive(Debug, Default)]
pub struct FlakyPersistence {
    inner: InMemoryPersistence,
    broken: AtomicBool,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a transaction error.
    pub fn break_store(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn repair(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }

    /// Store a record whose payload is not a valid entry.
    pub async fn corrupt(&self, key: &str, expires_at: DateTime<Utc>) {
        let record = PersistedRecord::new(b"\xffnot json".to_vec(), expires_at);
        // The inner store only fails on a poisoned lock.
        let _ = self.inner.set(key, record).await;
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(PersistenceError::Transaction {
                reason: "store is broken".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DurablePersistence for FlakyPersistence {
    async fn get(&self, key: &str) -> Result<Option<PersistedRecord>, PersistenceError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, record: PersistedRecord) -> Result<(), PersistenceError> {
        self.check()?;
        self.inner.set(key, record).await
    }

    async fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.check()?;
        self.inner.keys().await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        self.check()?;
        self.inner.purge_expired(now).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, params and increment streams.

    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Generate a key namespace such as `tools` or `categories`.
    pub fn arb_namespace() -> impl Strategy<Value = String> {
        "[a-z]{1,12}"
    }

    /// Generate a scalar JSON value, nulls included.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::from),
            "[a-zA-Z0-9 _-]{0,16}".prop_map(Value::String),
        ]
    }

    /// Generate a flat filter object, the shape listing endpoints key on.
    pub fn arb_params() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z_]{1,10}", arb_scalar(), 0..8)
            .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
    }

    /// Generate a target id from a small pool so streams repeat targets.
    pub fn arb_target_id() -> impl Strategy<Value = String> {
        (0u8..6).prop_map(|n| format!("tool-{}", n))
    }

    /// Generate a stream of `(target_id, delta)` increments.
    pub fn arb_increments(max_len: usize) -> impl Strategy<Value = Vec<(String, i64)>> {
        prop::collection::vec((arb_target_id(), -5i64..50), 0..max_len)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common cache scenarios.

    use super::*;

    /// One tool in a directory listing.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ToolSummary {
        pub id: String,
        pub name: String,
        pub views: i64,
    }

    /// A page of the tool directory, the typical cached value.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ToolListing {
        pub page: u32,
        pub category: Option<String>,
        pub tools: Vec<ToolSummary>,
    }

    /// Build a listing page with `size` tools.
    pub fn tool_listing(page: u32, size: usize) -> ToolListing {
        ToolListing {
            page,
            category: None,
            tools: (0..size)
                .map(|i| ToolSummary {
                    id: format!("tool-{}-{}", page, i),
                    name: format!("Tool {}", i),
                    views: 0,
                })
                .collect(),
        }
    }

    /// Key for a listing page, encoded the way handlers encode it.
    pub fn listing_key(page: u32) -> CacheKey {
        CacheKey::encode("tools", &serde_json::json!({ "page": page }))
    }

    /// Key for a category page.
    pub fn category_key(slug: &str) -> CacheKey {
        CacheKey::encode("categories", &serde_json::json!({ "slug": slug }))
    }

    /// Cache config with a small capacity and an hour-long sweep interval.
    pub fn test_cache_config() -> CacheConfig {
        CacheConfig::default()
            .with_max_entries(64)
            .with_sweep_interval(Duration::from_secs(3600))
    }

    /// Coalescer config with short delays for paused-time tests.
    pub fn fast_coalescer_config() -> CoalescerConfig {
        CoalescerConfig::default()
            .with_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(50), Duration::from_millis(400))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Toolshed error variants.

    use super::*;

    /// Assert that a ToolshedResult is a `FetchError::Failed`.
    #[track_caller]
    pub fn assert_fetch_failed<T: std::fmt::Debug>(result: &ToolshedResult<T>) {
        match result {
            Err(ToolshedError::Fetch(FetchError::Failed { .. })) => {}
            other => panic!("Expected Fetch(Failed) error, got: {:?}", other),
        }
    }

    /// Assert that a ToolshedResult is a `FetchError::Aborted`.
    #[track_caller]
    pub fn assert_fetch_aborted<T: std::fmt::Debug>(result: &ToolshedResult<T>) {
        match result {
            Err(ToolshedError::Fetch(FetchError::Aborted { .. })) => {}
            other => panic!("Expected Fetch(Aborted) error, got: {:?}", other),
        }
    }

    /// Assert that a ToolshedResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &ToolshedResult<T>) {
        match result {
            Err(ToolshedError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::starting_now();
        let other = clock.clone();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), other.now());

        let later = Utc::now() + chrono::Duration::hours(1);
        other.set(later);
        assert_eq!(clock.now(), later);
    }

    #[tokio::test]
    async fn test_counting_fetcher_scripted_failures() {
        let fetcher = CountingFetcher::new("tools:{}", 7u32);
        fetcher.fail_next(2);

        assertions::assert_fetch_failed(&fetcher.fetch().await);
        assertions::assert_fetch_failed(&fetcher.fetch().await);
        assert_eq!(fetcher.fetch().await.unwrap(), 7);

        fetcher.set_value(8);
        assert_eq!(fetcher.clone().fetch().await.unwrap(), 8);
        assert_eq!(fetcher.calls(), 4);
    }

    #[tokio::test]
    async fn test_gated_fetcher_release_before_call() {
        let fetcher = GatedFetcher::new("tools:{}", "v".to_string());
        fetcher.release(1);
        assert_eq!(fetcher.fetch().await.unwrap(), "v");

        fetcher.abort();
        assertions::assert_fetch_aborted(&fetcher.fetch().await);
    }

    #[tokio::test]
    async fn test_recording_counter_store_failure_budget() {
        let store = RecordingCounterStore::new();
        store.fail_times("a", 1);

        assert!(store.increment("a", 2).await.is_err());
        store.increment("a", 2).await.unwrap();
        store.increment("b", 1).await.unwrap();

        assert_eq!(store.total("a"), 2);
        assert_eq!(store.grand_total(), 3);
        assert_eq!(store.attempts(), 3);
        assert_eq!(
            store.sorted_writes(),
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );

        store.fail_target("b");
        assert!(store.increment("b", 1).await.is_err());
        store.heal("b");
        assert!(store.increment("b", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_flaky_persistence() {
        let store = FlakyPersistence::new();
        store.corrupt("k", Utc::now()).await;
        assert_eq!(store.len(), 1);

        store.break_store();
        assert!(matches!(
            store.get("k").await,
            Err(PersistenceError::Transaction { .. })
        ));
        store.repair();
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[test]
    fn test_fixture_configs_are_valid() {
        fixtures::test_cache_config().validate().unwrap();
        fixtures::fast_coalescer_config().validate().unwrap();
    }

    #[test]
    fn test_listing_keys() {
        assert_eq!(fixtures::listing_key(2).as_str(), r#"tools:{"page":2}"#);
        assert_eq!(fixtures::category_key("ai").namespace(), "categories");
        assert_eq!(fixtures::tool_listing(1, 3).tools.len(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_params_are_objects(params in generators::arb_params()) {
            prop_assert!(params.is_object());
        }

        #[test]
        fn prop_generated_increments_use_pool(stream in generators::arb_increments(20)) {
            for (target, _) in stream {
                prop_assert!(target.starts_with("tool-"));
            }
        }
    }
}
