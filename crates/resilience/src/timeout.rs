//! Deadline enforcement for single attempts.
//!
//! [`TimeoutRunner::run`] bounds an async operation and turns every way it can
//! end into a [`ResilienceResult`]: its own error becomes
//! [`ResilienceError::OperationFailed`], a panic becomes
//! [`ResilienceError::Panicked`], and running out of time becomes
//! [`ResilienceError::Timeout`]. When the deadline fires the future is dropped,
//! which is the cancellation signal for async work.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{panic_message, ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Applies a per-attempt deadline, falling back to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutRunner {
    default_timeout: Duration,
}

impl TimeoutRunner {
    /// Deadline used when neither the caller nor a breaker supplies one.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a runner with a non-zero default deadline.
    pub fn new(default_timeout: Duration) -> ConfigResult<Self> {
        if default_timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "default_timeout must be greater than zero"));
        }
        Ok(Self { default_timeout })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The deadline that applies to a call given an optional override.
    pub fn resolve(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    /// Run `operation` under `timeout`, or the default deadline when `None`.
    pub async fn run<Fut, T, E>(&self, operation: Fut, timeout: Option<Duration>) -> ResilienceResult<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        with_timeout(self.resolve(timeout), operation).await
    }

    /// Run a synchronous closure on tokio's blocking pool under a deadline.
    ///
    /// Best effort: when the deadline fires only the caller's wait ends. The
    /// closure keeps running on its thread until it returns, and its result is
    /// discarded.
    pub async fn run_blocking<F, T, E>(&self, operation: F, timeout: Option<Duration>) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let limit = self.resolve(timeout);
        let handle =
            tokio::task::spawn_blocking(move || std::panic::catch_unwind(AssertUnwindSafe(operation)));

        match tokio::time::timeout(limit, handle).await {
            Err(_) => {
                warn!(timeout = ?limit, "blocking operation timed out, thread left running");
                Err(ResilienceError::Timeout { timeout: limit, invoked: true })
            }
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    let payload = join_error.into_panic();
                    Err(ResilienceError::Panicked { message: panic_message(payload.as_ref()) })
                } else {
                    debug!("blocking task cancelled by runtime shutdown");
                    Err(ResilienceError::Cancelled { invoked: true })
                }
            }
            Ok(Ok(Err(payload))) => {
                let message = panic_message(payload.as_ref());
                warn!(%message, "blocking operation panicked");
                Err(ResilienceError::Panicked { message })
            }
            Ok(Ok(Ok(result))) => result.map_err(|source| ResilienceError::OperationFailed { source }),
        }
    }
}

impl Default for TimeoutRunner {
    fn default() -> Self {
        Self { default_timeout: Self::DEFAULT_TIMEOUT }
    }
}

/// Bound `operation` by `timeout`, catching panics.
///
/// ```rust
/// use std::time::Duration;
///
/// use tradeguard_resilience::{with_timeout, ErrorKind};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let slow = async {
///     tokio::time::sleep(Duration::from_secs(5)).await;
///     Ok::<_, std::io::Error>(())
/// };
/// let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
/// assert_eq!(err.kind(), ErrorKind::Timeout);
/// # }
/// ```
pub async fn with_timeout<Fut, T, E>(timeout: Duration, operation: Fut) -> ResilienceResult<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(operation).catch_unwind()).await {
        Err(_) => {
            debug!(?timeout, "operation timed out");
            Err(ResilienceError::Timeout { timeout, invoked: true })
        }
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            warn!(%message, "operation panicked");
            Err(ResilienceError::Panicked { message })
        }
        Ok(Ok(result)) => result.map_err(|source| ResilienceError::OperationFailed { source }),
    }
}
