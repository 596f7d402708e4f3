//! Error surface of the resilience layer
//!
//! Every failure a caller can observe is a [`ResilienceError`]. The variants
//! split into two groups that callers usually branch on:
//!
//! - **Admission rejections** ([`CircuitOpen`], [`RateLimitExceeded`],
//!   [`BulkheadFull`], [`InvalidConfiguration`], and [`Cancelled`] or
//!   [`Timeout`] with `invoked: false`): the operation never ran.
//! - **Execution failures** ([`OperationFailed`], [`Panicked`], and
//!   [`Timeout`] or [`Cancelled`] with `invoked: true`): the operation ran
//!   (possibly several times) and the last attempt failed or was abandoned.
//!
//! Retry exhaustion is not its own variant. When every attempt fails, the last
//! attempt's error is returned unchanged so the caller sees the real cause.
//!
//! [`CircuitOpen`]: ResilienceError::CircuitOpen
//! [`RateLimitExceeded`]: ResilienceError::RateLimitExceeded
//! [`BulkheadFull`]: ResilienceError::BulkheadFull
//! [`Cancelled`]: ResilienceError::Cancelled
//! [`InvalidConfiguration`]: ResilienceError::InvalidConfiguration
//! [`OperationFailed`]: ResilienceError::OperationFailed
//! [`Panicked`]: ResilienceError::Panicked
//! [`Timeout`]: ResilienceError::Timeout

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Configuration problems detected when a primitive is created or settings
/// are loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its allowed range.
    #[error("invalid {component} configuration: {message}")]
    Invalid { component: &'static str, message: String },

    /// A settings file could not be read.
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A settings document could not be parsed.
    #[error("failed to parse settings: {0}")]
    Parse(String),

    /// An environment override holds an unusable value.
    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(component: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { component, message: message.into() }
    }
}

/// Result alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors returned by resilience-wrapped operations.
///
/// Generic over the operation's own error type `E`, which is passed through
/// untouched in [`ResilienceError::OperationFailed`].
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit breaker for this dependency is open (or a half-open probe
    /// is already in flight).
    #[error("circuit breaker '{name}' is open, rejecting calls")]
    CircuitOpen { name: String },

    /// The attempt, or the caller's overall deadline, ran out of time.
    /// `invoked` is `false` when the deadline fired before any attempt
    /// started.
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration, invoked: bool },

    /// The rate limiter did not grant a permit within the allowed wait.
    #[error("rate limit exceeded for '{name}': {max_requests} requests per {window:?}")]
    RateLimitExceeded { name: String, max_requests: usize, window: Duration },

    /// The bulkhead had no free slot within the allowed wait.
    #[error("bulkhead '{name}' is full: {capacity} concurrent operations")]
    BulkheadFull { name: String, capacity: usize },

    /// The operation panicked; the panic was caught and counted as a failure.
    #[error("operation panicked: {message}")]
    Panicked { message: String },

    /// The caller's cancellation token fired before the call completed.
    /// `invoked` is `true` when an attempt had already started, so the
    /// dependency may have seen the request.
    #[error("operation cancelled by caller")]
    Cancelled { invoked: bool },

    /// The operation itself returned an error.
    #[error("operation failed: {source}")]
    OperationFailed {
        #[source]
        source: E,
    },

    /// A primitive could not be created from the supplied configuration.
    #[error(transparent)]
    InvalidConfiguration(#[from] ConfigError),
}

/// Result alias for resilience-wrapped operations.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Copyable discriminant of [`ResilienceError`], handy for matching and for
/// labelling metrics in an external exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    Timeout,
    RateLimitExceeded,
    BulkheadFull,
    Panicked,
    Cancelled,
    OperationFailed,
    InvalidConfiguration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::BulkheadFull => "bulkhead_full",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
            Self::OperationFailed => "operation_failed",
            Self::InvalidConfiguration => "invalid_configuration",
        };
        f.write_str(label)
    }
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            Self::Panicked { .. } => ErrorKind::Panicked,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::OperationFailed { .. } => ErrorKind::OperationFailed,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
        }
    }

    /// `true` when the request was refused before the operation ran.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RateLimitExceeded { .. }
                | Self::BulkheadFull { .. }
                | Self::InvalidConfiguration(_)
                | Self::Cancelled { invoked: false }
                | Self::Timeout { invoked: false, .. }
        )
    }

    /// `true` when the operation ran and its last attempt failed.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed { .. }
                | Self::Panicked { .. }
                | Self::Timeout { invoked: true, .. }
                | Self::Cancelled { invoked: true }
        )
    }

    /// Borrow the operation's own error, if that is what failed.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }

    /// Take the operation's own error, if that is what failed.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
