//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing` output with per-module levels
//! - **Metrics**: Prometheus recorder plus the cache's counters and histograms
//!
//! # Example
//!
//! ```rust,no_run
//! use wsauth_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::default();
//! let _telemetry = init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, CacheMetrics, MetricsConfig, MetricsRegistry, OperationTimer};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name for identification in logs and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "wsauth".to_string()
}

fn default_environment() -> String {
    std::env::var("WSAUTH_ENVIRONMENT").unwrap_or_else(|_| "production".to_string())
}

/// Initialize logging and metrics. Call once at startup.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging, &config.environment)?;

    Ok(TelemetryHandle { metrics })
}

/// Handle for the installed telemetry stack.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}
