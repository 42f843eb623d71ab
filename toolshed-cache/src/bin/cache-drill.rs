//! Cache Drill - load driver for the cache layer
//!
//! Runs a burst of concurrent listing reads and view increments against
//! in-process fake backends, drains the coalescer and logs the final stats.
//!
//! Usage:
//!   cache-drill --readers 64 --views 500 --keys 8
//!
//! Environment variables:
//!   TOOLSHED_CACHE_* / TOOLSHED_COALESCER_* - cache and coalescer settings
//!   TOOLSHED_CACHE_DURABLE_PATH - enables the LMDB tier when set
//!   TOOLSHED_LOG_FORMAT - `json` or `pretty`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use toolshed_cache::{
    init_tracing, CacheConfig, CacheKey, CacheService, CoalescerConfig, CounterStore,
    TelemetryConfig, ToolshedResult,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cache-drill")]
#[command(about = "Drive concurrent reads and counter writes through the cache layer")]
#[command(version)]
struct Args {
    /// Concurrent listing readers
    #[arg(long, default_value = "32")]
    readers: usize,

    /// View increments to record
    #[arg(long, default_value = "200")]
    views: usize,

    /// Distinct listing pages to spread reads over
    #[arg(long, default_value = "4")]
    keys: usize,

    /// Simulated upstream latency in milliseconds
    #[arg(long, default_value = "25")]
    latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Listing {
    page: usize,
    tools: Vec<String>,
}

/// Stand-in for the directory database's tool listing query.
struct FakeDirectory {
    queries: AtomicU64,
    latency: Duration,
}

impl FakeDirectory {
    async fn list_tools(&self, page: usize) -> ToolshedResult<Listing> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        Ok(Listing {
            page,
            tools: (0..10).map(|i| format!("tool-{}-{}", page, i)).collect(),
        })
    }
}

/// Stand-in for the view counter table.
#[derive(Default)]
struct FakeCounters {
    totals: DashMap<String, i64>,
    writes: AtomicU64,
}

#[async_trait]
impl CounterStore for FakeCounters {
    async fn increment(&self, target_id: &str, amount: i64) -> ToolshedResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        *self.totals.entry(target_id.to_string()).or_insert(0) += amount;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ToolshedResult<()> {
    init_tracing(&TelemetryConfig::from_env()?)?;
    let args = Args::parse();

    let directory = Arc::new(FakeDirectory {
        queries: AtomicU64::new(0),
        latency: Duration::from_millis(args.latency_ms),
    });
    let counters = Arc::new(FakeCounters::default());

    let service: Arc<CacheService<Listing, FakeCounters>> = Arc::new(CacheService::new(
        CacheConfig::from_env(),
        counters.clone(),
        CoalescerConfig::from_env(),
    )?);
    service.spawn_sweeper();

    info!(
        readers = args.readers,
        views = args.views,
        keys = args.keys,
        "Starting cache drill"
    );

    let pages = args.keys.max(1);
    let mut readers = Vec::with_capacity(args.readers);
    for reader in 0..args.readers {
        let service = service.clone();
        let directory = directory.clone();
        readers.push(tokio::spawn(async move {
            let page = reader % pages;
            let key = CacheKey::encode_params("tools", &serde_json::json!({ "page": page }))?;
            let options = service.options();
            service
                .fetch_with_cache(
                    &key,
                    move || {
                        let directory = directory.clone();
                        async move { directory.list_tools(page).await }
                    },
                    &options,
                )
                .await
        }));
    }

    for view in 0..args.views {
        service.record_increment(&format!("tool-{}", view % pages), 1);
    }

    let mut failed_reads = 0usize;
    for reader in readers {
        match reader.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                failed_reads += 1;
                warn!(error = %e, "Read failed");
            }
            Err(e) => {
                failed_reads += 1;
                warn!(error = %e, "Reader task failed");
            }
        }
    }

    let report = service.shutdown().await;
    let stats = service.stats();
    let delivered: i64 = counters.totals.iter().map(|entry| *entry.value()).sum();

    info!(
        upstream_queries = directory.queries.load(Ordering::Relaxed),
        failed_reads,
        hits = stats.hits,
        misses = stats.misses,
        entry_count = stats.entry_count,
        counter_writes = counters.writes.load(Ordering::Relaxed),
        views_delivered = delivered,
        dead_lettered = stats.dead_lettered,
        drain_succeeded = report.succeeded,
        "Cache drill complete"
    );

    Ok(())
}
