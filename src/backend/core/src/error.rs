//! Error handling for the authorization cache.
//!
//! This module provides:
//! - A crate-wide error type with stable, machine-readable codes
//! - Severity and category classification for logging and alerting
//! - Error chaining with context
//! - Metrics integration for error tracking
//!
//! Module-level failures (`FeedError`, `EvaluationError`, `LifecycleError`,
//! `SelectorError`) are typed `thiserror` enums that convert into
//! [`AuthzError`] at API boundaries.
//!
//! # Usage
//!
//! ```rust,ignore
//! use wsauth_core::error::{AuthzError, ErrorCode, ErrorContext, Result};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("snapshot.yaml")
//!         .with_error_code(ErrorCode::InvalidInput)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::authz::lifecycle::LifecycleError;
use crate::authz::lister::SelectorError;
use crate::feed::FeedError;
use crate::rbac::EvaluationError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for authorization cache operations.
pub type Result<T> = std::result::Result<T, AuthzError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Feed Errors (1000-1099)
    FeedUnavailable,
    FeedLagged,
    FeedClosed,
    SnapshotFailed,
    StaleSnapshot,

    // Policy Errors (1100-1199)
    EvaluationFailed,
    RoleNotFound,

    // Lifecycle Errors (1200-1299)
    AlreadyStarted,
    AlreadyStopped,
    NotOwner,
    NoRuntime,

    // Input Errors (4100-4199)
    InvalidSelector,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::FeedUnavailable => 1000,
            Self::FeedLagged => 1001,
            Self::FeedClosed => 1002,
            Self::SnapshotFailed => 1003,
            Self::StaleSnapshot => 1004,

            Self::EvaluationFailed => 1100,
            Self::RoleNotFound => 1101,

            Self::AlreadyStarted => 1200,
            Self::AlreadyStopped => 1201,
            Self::NotOwner => 1202,
            Self::NoRuntime => 1203,

            Self::InvalidSelector => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Check if the failed operation may succeed when retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FeedUnavailable
                | Self::FeedLagged
                | Self::FeedClosed
                | Self::SnapshotFailed
                | Self::StaleSnapshot
                | Self::EvaluationFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "feed",
            1100..=1199 => "policy",
            1200..=1299 => "lifecycle",
            4100..=4199 => "input",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes (bad selector, bad input)
    Low,
    /// Transient operational issues healed by the next resync
    Medium,
    /// Programming errors and misconfiguration
    High,
    /// The cache cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidSelector | ErrorCode::InvalidInput => Self::Low,

            ErrorCode::FeedLagged
            | ErrorCode::FeedClosed
            | ErrorCode::StaleSnapshot
            | ErrorCode::EvaluationFailed
            | ErrorCode::RoleNotFound => Self::Medium,

            ErrorCode::AlreadyStarted
            | ErrorCode::AlreadyStopped
            | ErrorCode::NotOwner
            | ErrorCode::NoRuntime
            | ErrorCode::FeedUnavailable
            | ErrorCode::SnapshotFailed
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related resource key (workspace or binding name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// Related resource kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, kind: impl Into<String>, key: impl Into<String>) -> Self {
        self.resource_kind = Some(kind.into());
        self.resource = Some(key.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the authorization cache.
#[derive(Error, Debug)]
pub struct AuthzError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for AuthzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl AuthzError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both public and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "wsauth_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions from module errors
// ═══════════════════════════════════════════════════════════════════════════════

impl From<FeedError> for AuthzError {
    fn from(err: FeedError) -> Self {
        let code = match &err {
            FeedError::Lagged { .. } => ErrorCode::FeedLagged,
            FeedError::Closed { .. } => ErrorCode::FeedClosed,
            FeedError::Unavailable { .. } => ErrorCode::FeedUnavailable,
        };
        let kind = err.kind();
        Self::new(code, err.to_string())
            .with_details(ErrorDetails::new().with_context("kind", kind))
            .with_source(err)
    }
}

impl From<EvaluationError> for AuthzError {
    fn from(err: EvaluationError) -> Self {
        let code = match &err {
            EvaluationError::RoleNotFound(_) => ErrorCode::RoleNotFound,
            EvaluationError::Failed { .. } => ErrorCode::EvaluationFailed,
        };
        Self::new(code, err.to_string()).with_source(err)
    }
}

impl From<LifecycleError> for AuthzError {
    fn from(err: LifecycleError) -> Self {
        let code = match &err {
            LifecycleError::AlreadyStarted { .. } => ErrorCode::AlreadyStarted,
            LifecycleError::AlreadyStopped => ErrorCode::AlreadyStopped,
            LifecycleError::NotOwner => ErrorCode::NotOwner,
            LifecycleError::NoRuntime => ErrorCode::NoRuntime,
        };
        Self::new(code, err.to_string()).with_source(err)
    }
}

impl From<SelectorError> for AuthzError {
    fn from(err: SelectorError) -> Self {
        Self::new(ErrorCode::InvalidSelector, err.to_string()).with_source(err)
    }
}

impl From<config::ConfigError> for AuthzError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            err.to_string(),
        )
        .with_source(err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| AuthzError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| AuthzError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| AuthzError::new(ErrorCode::InvalidInput, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| AuthzError::new(code, "Value not present"))
    }
}
