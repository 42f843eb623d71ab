//! Tracing subscriber initialization.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` (from
//! `RUST_LOG`, falling back to [`TelemetryConfig::default_filter`]) and a
//! single fmt layer in either JSON or pretty form.

use std::str::FromStr;

use toolshed_core::{ConfigError, ToolshedError, ToolshedResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(ConfigError::InvalidValue {
                field: "TOOLSHED_LOG_FORMAT".to_string(),
                value: other.to_string(),
                reason: "expected `json` or `pretty`".to_string(),
            }),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log line format (`TOOLSHED_LOG_FORMAT`)
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: "toolshed_cache=debug,info".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `TOOLSHED_LOG_FORMAT`. An unset variable keeps the default.
    pub fn from_env() -> ToolshedResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("TOOLSHED_LOG_FORMAT") {
            config.format = raw.parse()?;
        }
        Ok(config)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. A second call fails with
/// [`ToolshedError::Telemetry`] because a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> ToolshedResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| ToolshedError::Telemetry {
            reason: format!("Invalid log filter: {}", e),
        })?;

    let (json, pretty) = match config.format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().pretty())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(pretty)
        .try_init()
        .map_err(|e| ToolshedError::Telemetry {
            reason: format!("Failed to init subscriber: {}", e),
        })?;

    tracing::info!(format = ?config.format, "Telemetry initialized");
    Ok(())
}
