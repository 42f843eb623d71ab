//! Shared service construction for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use toolshed_cache::{CacheService, DurablePersistence};
use toolshed_test_utils::fixtures::{self, ToolListing};
use toolshed_test_utils::{ManualClock, RecordingCounterStore};

pub type TestService = CacheService<ToolListing, RecordingCounterStore>;

pub struct Harness {
    pub service: TestService,
    pub counters: Arc<RecordingCounterStore>,
    pub clock: ManualClock,
}

/// Service over a manual clock, the fast coalescer config and no durable tier.
pub fn harness() -> Harness {
    build(None)
}

/// Same as [`harness`], with `durable` as the second tier.
pub fn harness_with(durable: Arc<dyn DurablePersistence>) -> Harness {
    build(Some(durable))
}

fn build(durable: Option<Arc<dyn DurablePersistence>>) -> Harness {
    let clock = ManualClock::starting_now();
    let counters = Arc::new(RecordingCounterStore::new());
    let mut builder = TestService::builder(fixtures::test_cache_config(), counters.clone())
        .coalescer_config(fixtures::fast_coalescer_config())
        .with_clock(Arc::new(clock.clone()));
    if let Some(durable) = durable {
        builder = builder.with_persistence(durable);
    }
    let service = builder.build().expect("test service should build");

    Harness {
        service,
        counters,
        clock,
    }
}

/// Yield until every background refresh has settled.
pub async fn settle_refreshes(service: &TestService) {
    while service.stats().pending_refreshes > 0 {
        tokio::task::yield_now().await;
    }
}

/// Yield until every shared fetch has settled.
pub async fn settle_fetches(service: &TestService) {
    while service.stats().pending_fetches > 0 {
        tokio::task::yield_now().await;
    }
}
