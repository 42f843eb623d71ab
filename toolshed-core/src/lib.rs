//! Toolshed Core - Shared Types
//!
//! Error taxonomy, configuration and clock abstraction shared by the cache
//! layer and its test utilities. No caching behavior lives here.

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;

pub use clock::{add_duration, Clock, SystemClock};
pub use config::{CacheConfig, CoalescerConfig};
pub use error::{
    ConfigError, FetchError, FlushError, PersistenceError, ToolshedError, ToolshedResult,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
