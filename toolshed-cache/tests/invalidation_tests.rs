//! Invalidation Tests
//!
//! Exact and wildcard invalidation through the service, the guarantee that
//! a fetch started before an invalidation cannot repopulate the key, and that
//! fetches and refreshes of keys the invalidation did not cover still land.

use std::sync::Arc;
use std::time::Duration;

use toolshed_cache::{CacheKey, FetchOptions, ReadSource};
use toolshed_test_utils::fixtures::{category_key, listing_key, tool_listing};
use toolshed_test_utils::{CountingFetcher, GatedFetcher};

#[path = "support/service.rs"]
mod test_service_support;
use test_service_support::{harness, settle_fetches, settle_refreshes, TestService};

async fn warm(service: &TestService, key: &CacheKey) {
    let fetcher = CountingFetcher::new(key.as_str(), tool_listing(1, 1));
    service
        .fetch_with_cache(key, fetcher, &service.options())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_wildcard_removes_namespace_only() {
    let h = harness();
    let tools = [listing_key(1), listing_key(2), listing_key(3)];
    let categories = [category_key("ai"), category_key("devops")];
    for key in tools.iter().chain(categories.iter()) {
        warm(&h.service, key).await;
    }

    assert_eq!(h.service.invalidate_pattern("tools:*").await.unwrap(), 3);

    for key in &tools {
        assert!(h.service.store().get(key).await.is_none(), "{} should be gone", key);
    }
    for key in &categories {
        assert!(h.service.store().get(key).await.is_some(), "{} should remain", key);
    }
}

#[tokio::test]
async fn test_exact_invalidation() {
    let h = harness();
    warm(&h.service, &listing_key(1)).await;
    warm(&h.service, &listing_key(2)).await;

    assert_eq!(h.service.invalidate(&listing_key(1)).await, 1);
    assert!(h.service.store().get(&listing_key(1)).await.is_none());
    assert!(h.service.store().get(&listing_key(2)).await.is_some());
}

#[tokio::test]
async fn test_no_match_is_not_an_error() {
    let h = harness();
    warm(&h.service, &listing_key(1)).await;

    assert_eq!(h.service.invalidate_pattern("reviews:*").await.unwrap(), 0);
    assert_eq!(h.service.invalidate(&CacheKey::namespace_only("reviews")).await, 0);
    assert_eq!(h.service.stats().entry_count, 1);
}

#[tokio::test]
async fn test_pattern_matches_inside_params() {
    let h = harness();
    let ai = CacheKey::encode("tools", &serde_json::json!({ "category": "ai", "page": 1 }));
    let ops = CacheKey::encode("tools", &serde_json::json!({ "category": "ops", "page": 1 }));
    warm(&h.service, &ai).await;
    warm(&h.service, &ops).await;

    assert_eq!(
        h.service
            .invalidate_pattern(r#"tools:{"category":"ai"*"#)
            .await
            .unwrap(),
        1
    );
    assert!(h.service.store().get(&ops).await.is_some());
}

#[tokio::test]
async fn test_in_flight_fetch_does_not_resurrect_key() {
    let h = harness();
    let service = Arc::new(h.service);
    let key = listing_key(1);
    let fetcher = GatedFetcher::new(key.as_str(), tool_listing(1, 9));

    let caller = {
        let service = service.clone();
        let key = key.clone();
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            service
                .fetch_with_cache(&key, fetcher, &service.options())
                .await
        })
    };
    fetcher.wait_for_calls(1).await;

    service.invalidate_pattern("tools:*").await.unwrap();
    fetcher.release(1);

    // The caller still gets the value it asked for; the cache does not keep it.
    assert_eq!(caller.await.unwrap().unwrap(), tool_listing(1, 9));
    settle_fetches(&service).await;
    assert!(service.store().get(&key).await.is_none());
}

#[tokio::test]
async fn test_in_flight_refresh_does_not_resurrect_key() {
    let h = harness();
    let key = listing_key(1);
    let opts = FetchOptions::with_ttl(Duration::from_secs(1))
        .stale_after(Duration::from_millis(100))
        .swr(true);

    let seed = CountingFetcher::new(key.as_str(), tool_listing(1, 1));
    h.service.fetch_with_cache(&key, seed, &opts).await.unwrap();
    h.clock.advance(Duration::from_millis(200));

    let refresh = GatedFetcher::new(key.as_str(), tool_listing(1, 2));
    let read = h.service.fetch_read(&key, refresh.clone(), &opts).await.unwrap();
    assert!(read.is_stale());
    refresh.wait_for_calls(1).await;

    assert_eq!(h.service.invalidate(&key).await, 1);
    refresh.release(1);
    settle_refreshes(&h.service).await;

    assert!(h.service.store().get(&key).await.is_none());
}

#[tokio::test]
async fn test_exact_key_with_literal_star_removes_only_itself() {
    let h = harness();
    let starred = CacheKey::encode("search", &serde_json::json!({ "q": "a*" }));
    let plain = CacheKey::encode("search", &serde_json::json!({ "q": "abc" }));
    warm(&h.service, &starred).await;
    warm(&h.service, &plain).await;

    assert_eq!(h.service.invalidate(&starred).await, 1);
    assert!(h.service.store().get(&starred).await.is_none());
    assert!(h.service.store().get(&plain).await.is_some());
}

#[tokio::test]
async fn test_unrelated_invalidation_keeps_in_flight_fetch() {
    let h = harness();
    let service = Arc::new(h.service);
    let key = listing_key(1);
    let fetcher = GatedFetcher::new(key.as_str(), tool_listing(1, 4));

    let caller = {
        let service = service.clone();
        let key = key.clone();
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            service
                .fetch_with_cache(&key, fetcher, &service.options())
                .await
        })
    };
    fetcher.wait_for_calls(1).await;

    assert_eq!(service.invalidate_pattern("categories:*").await.unwrap(), 0);
    assert_eq!(service.invalidate(&category_key("ai")).await, 0);
    fetcher.release(1);

    assert_eq!(caller.await.unwrap().unwrap(), tool_listing(1, 4));
    settle_fetches(&service).await;
    assert_eq!(service.stats().entry_count, 1);

    let read = service
        .fetch_read(&key, fetcher.clone(), &service.options())
        .await
        .unwrap();
    assert_eq!(read.source(), ReadSource::Fresh);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_unrelated_invalidation_keeps_in_flight_refresh() {
    let h = harness();
    let key = listing_key(1);
    let opts = FetchOptions::with_ttl(Duration::from_secs(1))
        .stale_after(Duration::from_millis(100))
        .swr(true);

    let seed = CountingFetcher::new(key.as_str(), tool_listing(1, 1));
    h.service.fetch_with_cache(&key, seed, &opts).await.unwrap();
    warm(&h.service, &category_key("ai")).await;
    h.clock.advance(Duration::from_millis(200));

    let refresh = GatedFetcher::new(key.as_str(), tool_listing(1, 2));
    let read = h.service.fetch_read(&key, refresh.clone(), &opts).await.unwrap();
    assert!(read.is_stale());
    refresh.wait_for_calls(1).await;

    assert_eq!(h.service.invalidate_pattern("categories:*").await.unwrap(), 1);
    refresh.release(1);
    settle_refreshes(&h.service).await;

    let read = h.service.fetch_read(&key, refresh.clone(), &opts).await.unwrap();
    assert_eq!(read.source(), ReadSource::Fresh);
    assert_eq!(read.into_value(), tool_listing(1, 2));
}
