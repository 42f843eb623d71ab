//! Error types for Toolshed cache operations

use thiserror::Error;

/// Errors raised while producing a value for the read path.
///
/// These are the only errors that reach a `fetch_with_cache` caller. Every
/// subscriber of a shared fetch receives a clone of the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed for {key}: {reason}")]
    Failed { key: String, reason: String },

    #[error("Fetch for {key} was aborted before it settled")]
    Aborted { key: String },

    #[error("Upstream returned no value for {key}")]
    NotFound { key: String },
}

/// Durable tier errors. Logged and degraded to a miss, never surfaced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Failed to open durable store: {reason}")]
    Open { reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Durable store lock poisoned")]
    LockPoisoned,
}

/// Counter write errors raised during a coalescer flush.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlushError {
    #[error("Increment of {target_id} failed: {reason}")]
    WriteFailed { target_id: String, reason: String },

    #[error("Flush task for {targets} targets aborted")]
    Aborted { targets: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Toolshed errors.
#[derive(Debug, Clone, Error)]
pub enum ToolshedError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Flush error: {0}")]
    Flush(#[from] FlushError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid cache key parameters: {reason}")]
    InvalidKey { reason: String },

    #[error("Telemetry setup failed: {reason}")]
    Telemetry { reason: String },
}

impl ToolshedError {
    /// Shorthand for a fetcher failure on `key`.
    pub fn fetch_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch(FetchError::Failed {
            key: key.into(),
            reason: reason.into(),
        })
    }

    /// Shorthand for a counter backend failure on `target_id`.
    pub fn write_failed(target_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Flush(FlushError::WriteFailed {
            target_id: target_id.into(),
            reason: reason.into(),
        })
    }

    /// Returns true if this error came from a fetcher.
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

/// Result type alias for Toolshed operations.
pub type ToolshedResult<T> = Result<T, ToolshedError>;

// =============================================================================
// TESTS
// =============================================================================
