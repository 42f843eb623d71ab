//! Background jobs for the cache layer.
//!
//! - `sweeper`: purges expired entries from both cache tiers
//!
//! # Usage
//!
//! ```ignore
//! use toolshed_cache::jobs::sweep_task;
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(sweep_task(store.clone(), Duration::from_secs(60), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```
//!
//! `CacheService::spawn_sweeper` wires this up for you.

pub mod sweeper;

pub use sweeper::{sweep_task, SweepMetrics, SweepSnapshot};
