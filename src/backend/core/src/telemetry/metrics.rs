//! Prometheus metrics for the authorization cache.
//!
//! - Rebuild duration histograms with configurable buckets
//! - Event counters by kind and outcome
//! - Index size gauges
//! - Error counters by code (recorded by `AuthzError::log`)
//!
//! # Example
//!
//! ```rust,no_run
//! use wsauth_core::telemetry::metrics::CacheMetrics;
//!
//! CacheMetrics::record_feed_restart("acme", "workspace");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for rebuild durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem by installing the Prometheus recorder.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "wsauth_index_events_total",
        "Change events processed by the authorization index, by kind and outcome"
    );
    describe_counter!(
        "wsauth_evaluation_failures_total",
        "Policy evaluations that failed and left an update inconclusive"
    );
    describe_counter!(
        "wsauth_membership_changes_total",
        "Workspace membership changes published to subscribers"
    );
    describe_gauge!("wsauth_index_subjects", "Subjects with at least one visible workspace");

    describe_counter!("wsauth_rebuilds_total", "Full index rebuilds, by result");
    describe_histogram!(
        "wsauth_rebuild_duration_seconds",
        "Duration of full index rebuilds in seconds"
    );
    describe_counter!(
        "wsauth_resync_requests_total",
        "Resync requests, by reason, including coalesced ones"
    );
    describe_counter!("wsauth_feed_restarts_total", "Feed subscriptions restarted after an error");
    describe_gauge!("wsauth_cache_ready", "Whether the organization's cache has completed its first rebuild");

    describe_counter!("wsauth_errors_total", "Errors by code and category");
}

/// Sync loop metrics, labelled by organization.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a completed or failed rebuild.
    pub fn record_rebuild(organization: &str, reason: &'static str, duration: Duration, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        counter!(
            "wsauth_rebuilds_total",
            "organization" => organization.to_string(),
            "reason" => reason,
            "result" => result,
        )
        .increment(1);

        histogram!(
            "wsauth_rebuild_duration_seconds",
            "organization" => organization.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_resync_request(organization: &str, reason: &'static str, coalesced: bool) {
        counter!(
            "wsauth_resync_requests_total",
            "organization" => organization.to_string(),
            "reason" => reason,
            "coalesced" => coalesced.to_string(),
        )
        .increment(1);
    }

    pub fn record_feed_restart(organization: &str, kind: &'static str) {
        counter!(
            "wsauth_feed_restarts_total",
            "organization" => organization.to_string(),
            "kind" => kind,
        )
        .increment(1);
    }

    pub fn set_ready(organization: &str, ready: bool) {
        gauge!("wsauth_cache_ready", "organization" => organization.to_string())
            .set(if ready { 1.0 } else { 0.0 });
    }
}

/// Measures one operation.
pub struct OperationTimer {
    start: Instant,
}

impl OperationTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
