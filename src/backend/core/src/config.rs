//! Configuration management.
//!
//! Values come from an optional file plus `WSAUTH__`-prefixed environment
//! variables, e.g. `WSAUTH__CACHE__RESYNC_INTERVAL=5s`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{AuthzError, ErrorCode, ErrorContext, Result};
use crate::rbac::{AccessRequest, TENANCY_GROUP, WORKSPACES_RESOURCE};
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "WSAUTH";
const ENV_SEPARATOR: &str = "__";

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Authorization cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging and metrics configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Per-organization authorization cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Interval between full resyncs; bounds staleness after a dropped event
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,

    /// Wait before retrying a failed rebuild or resubscribing a failed feed
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Capacity of the channel between feed pumps and the index worker
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Buffered membership notifications per subscriber
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// The access request whose authorized subjects the cache tracks
    #[serde(default)]
    pub access_request: AccessRequestConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync_interval: default_resync_interval(),
            retry_backoff: default_retry_backoff(),
            event_buffer: default_event_buffer(),
            notification_capacity: default_notification_capacity(),
            access_request: AccessRequestConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn access_request(&self) -> AccessRequest {
        AccessRequest::new(
            self.access_request.verb.clone(),
            self.access_request.api_group.clone(),
            self.access_request.resource.clone(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.resync_interval.is_zero() {
            return Err(AuthzError::invalid_config("cache.resync_interval must be positive"));
        }
        if self.event_buffer == 0 {
            return Err(AuthzError::invalid_config("cache.event_buffer must be positive"));
        }
        if self.notification_capacity == 0 {
            return Err(AuthzError::invalid_config(
                "cache.notification_capacity must be positive",
            ));
        }
        if self.access_request.verb.is_empty() || self.access_request.resource.is_empty() {
            return Err(AuthzError::invalid_config(
                "cache.access_request needs a verb and a resource",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessRequestConfig {
    #[serde(default = "default_verb")]
    pub verb: String,

    #[serde(default = "default_api_group")]
    pub api_group: String,

    #[serde(default = "default_resource")]
    pub resource: String,
}

impl Default for AccessRequestConfig {
    fn default() -> Self {
        Self {
            verb: default_verb(),
            api_group: default_api_group(),
            resource: default_resource(),
        }
    }
}

// Default value functions
fn default_resync_interval() -> Duration { Duration::from_secs(1) }
fn default_retry_backoff() -> Duration { Duration::from_millis(500) }
fn default_event_buffer() -> usize { 1024 }
fn default_notification_capacity() -> usize { 256 }
fn default_verb() -> String { "get".to_string() }
fn default_api_group() -> String { TENANCY_GROUP.to_string() }
fn default_resource() -> String { WORKSPACES_RESOURCE.to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.cache.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::metadata(path)
            .with_error_code(ErrorCode::ConfigurationError)
            .map_err(|err| err.with_context("path", path.display().to_string()))?;

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.cache.validate()?;
        Ok(cfg)
    }
}
