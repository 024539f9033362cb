//! Structured logging with JSON, pretty and compact formats.
//!
//! - JSON format for production environments
//! - Pretty format for development
//! - Per-module log level configuration

use serde::Deserialize;
use std::collections::HashMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level or filter directive (e.g. `info`, `wsauth_core=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default)]
    pub include_location: bool,

    /// Whether to include thread information
    #[serde(default)]
    pub include_thread: bool,

    /// Whether to include target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,

    /// Span event configuration
    #[serde(default)]
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_thread: false,
            include_target: default_include_target(),
            span_events: SpanEventConfig::default(),
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_module_level(mut self, module: impl Into<String>, level: impl Into<String>) -> Self {
        self.module_levels.insert(module.into(), level.into());
        self
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)?;
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(directive.parse()?);
        }
        Ok(filter)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production/structured logging
    #[default]
    Json,
    /// Pretty format for development
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Configuration for span event logging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub on_new: bool,

    #[serde(default)]
    pub on_close: bool,
}

impl SpanEventConfig {
    fn to_fmt_span(&self) -> FmtSpan {
        let mut span = FmtSpan::NONE;
        if self.on_new {
            span |= FmtSpan::NEW;
        }
        if self.on_close {
            span |= FmtSpan::CLOSE;
        }
        span
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_include_target() -> bool {
    true
}

/// Initialize the logging subsystem.
///
/// In the `development` environment a JSON format is swapped for pretty
/// output unless the configuration asks for something else.
///
/// # Errors
///
/// Returns an error if a filter directive is invalid or a global subscriber
/// is already installed.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let filter = config.filter()?;

    let format = if environment == "development" && config.format == LogFormat::Json {
        LogFormat::Pretty
    } else {
        config.format
    };

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.include_target);
    }

    #[test]
    fn test_filter_with_module_levels() {
        let config = LoggingConfig::default()
            .with_level("warn")
            .with_module_level("wsauth_core::authz", "debug");
        assert!(config.filter().is_ok());

        let bad = LoggingConfig::default().with_module_level("wsauth_core", "loud");
        assert!(bad.filter().is_err());
    }

    #[test]
    fn test_format_deserialize() {
        let format: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(format, LogFormat::Compact);
    }
}
