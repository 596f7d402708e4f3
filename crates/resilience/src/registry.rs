//! Named primitives and the composed execution path.
//!
//! A [`ResilienceRegistry`] owns every circuit breaker, rate limiter and
//! bulkhead in the process, keyed by dependency name, and composes them for a
//! single call in a fixed order:
//!
//! ```text
//! rate limiter -> bulkhead -> retry { circuit breaker -> timeout-bounded attempt }
//! ```
//!
//! The bulkhead slot is held across every retry attempt and released when the
//! call returns. Because retry wraps the breaker, a call rejected by an open
//! circuit consumes a retry attempt without running the operation. If the
//! circuit opens after some attempts already ran, the last of their failures
//! is returned instead of the rejection.
//!
//! Cancellation and the overall deadline report through `invoked` whether any
//! attempt had started, which decides if the dependency may have seen the
//! request.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{policies::AlwaysRetry, RetryConfig, RetryPolicy, RetryPredicate};
use crate::settings::ResilienceSettings;
use crate::stats::ResilienceStatistics;
use crate::timeout::TimeoutRunner;

/// Which protections to apply to one call.
///
/// Every field is optional; an empty set of options runs the operation once
/// under the registry's default timeout.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub rate_limiter: Option<RateLimiterConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub retry: Option<RetryConfig>,
    /// Per-attempt deadline, overriding the breaker's `call_timeout`.
    pub timeout: Option<Duration>,
    /// Budget for the whole call, waits and retries included.
    pub deadline: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Process-wide home of named resilience primitives.
///
/// ```rust
/// use std::time::Duration;
///
/// use tradeguard_resilience::{
///     CircuitBreakerConfig, ExecuteOptions, ResilienceRegistry, RetryConfig,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let registry = ResilienceRegistry::new();
/// let options = ExecuteOptions::new()
///     .with_circuit_breaker(CircuitBreakerConfig::default())
///     .with_retry(RetryConfig::builder().max_attempts(2).base_delay(Duration::from_millis(10)).build().unwrap());
///
/// let quote = registry
///     .execute("alpaca", &options, || async { Ok::<_, std::io::Error>(187.25) })
///     .await;
/// assert_eq!(quote.ok(), Some(187.25));
/// # }
/// ```
pub struct ResilienceRegistry<C: Clock + Clone = SystemClock> {
    circuit_breakers: DashMap<String, Arc<CircuitBreaker<C>>>,
    rate_limiters: DashMap<String, Arc<RateLimiter<C>>>,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
    runner: TimeoutRunner,
    clock: C,
}

impl<C: Clock + Clone> fmt::Debug for ResilienceRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceRegistry")
            .field("circuit_breakers", &self.circuit_breakers.len())
            .field("rate_limiters", &self.rate_limiters.len())
            .field("bulkheads", &self.bulkheads.len())
            .field("runner", &self.runner)
            .finish()
    }
}

impl ResilienceRegistry<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Build a registry whose runner uses the configured default timeout.
    pub fn from_settings(settings: &ResilienceSettings) -> ConfigResult<Self> {
        Ok(Self::new().with_runner(TimeoutRunner::new(settings.default_timeout)?))
    }
}

impl Default for ResilienceRegistry<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock + Clone> ResilienceRegistry<C> {
    /// Registry whose breakers and limiters all read time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self {
            circuit_breakers: DashMap::new(),
            rate_limiters: DashMap::new(),
            bulkheads: DashMap::new(),
            runner: TimeoutRunner::default(),
            clock,
        }
    }

    pub fn with_runner(mut self, runner: TimeoutRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn runner(&self) -> &TimeoutRunner {
        &self.runner
    }

    /// Get the breaker called `name`, creating it from `config` on first use.
    ///
    /// A different `config` on a later call is ignored.
    pub fn circuit_breaker(
        &self,
        name: &str,
        config: &CircuitBreakerConfig,
    ) -> ConfigResult<Arc<CircuitBreaker<C>>> {
        get_or_create(&self.circuit_breakers, "circuit_breaker", name, config, CircuitBreaker::config, || {
            CircuitBreaker::with_clock(name, config.clone(), self.clock.clone())
        })
    }

    /// Get the rate limiter called `name`, creating it from `config` on first
    /// use.
    pub fn rate_limiter(&self, name: &str, config: &RateLimiterConfig) -> ConfigResult<Arc<RateLimiter<C>>> {
        get_or_create(&self.rate_limiters, "rate_limiter", name, config, RateLimiter::config, || {
            RateLimiter::with_clock(name, config.clone(), self.clock.clone())
        })
    }

    /// Get the bulkhead called `name`, creating it from `config` on first use.
    pub fn bulkhead(&self, name: &str, config: &BulkheadConfig) -> ConfigResult<Arc<Bulkhead>> {
        get_or_create(&self.bulkheads, "bulkhead", name, config, Bulkhead::config, || {
            Bulkhead::new(name, config.clone())
        })
    }

    pub fn get_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker<C>>> {
        self.circuit_breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_rate_limiter(&self, name: &str) -> Option<Arc<RateLimiter<C>>> {
        self.rate_limiters.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_bulkhead(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot every registered primitive.
    pub fn statistics(&self) -> ResilienceStatistics {
        ResilienceStatistics {
            taken_at: Some(self.clock.utc_now()),
            circuit_breakers: self
                .circuit_breakers
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().stats()))
                .collect(),
            rate_limiters: self
                .rate_limiters
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().stats()))
                .collect(),
            bulkheads: self.bulkheads.iter().map(|entry| (entry.key().clone(), entry.value().stats())).collect(),
        }
    }

    /// Run `operation` for dependency `name`, retrying every retryable error.
    pub async fn execute<F, Fut, T, E>(
        &self,
        name: &str,
        options: &ExecuteOptions,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_with_predicate(name, options, &AlwaysRetry, operation).await
    }

    /// Run `operation` for dependency `name` with every protection selected in
    /// `options`.
    ///
    /// Timeouts, panics and open-circuit rejections are always retried while
    /// attempts remain. The operation's own errors are retried only when
    /// `predicate` accepts them.
    #[instrument(skip(self, name, options, predicate, operation), fields(dependency = %name))]
    pub async fn execute_with_predicate<F, Fut, T, E, P>(
        &self,
        name: &str,
        options: &ExecuteOptions,
        predicate: &P,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
        P: RetryPredicate<E> + ?Sized,
    {
        let invoked = AtomicBool::new(false);
        let cancelled = async {
            match &options.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match options.deadline {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => {
                let invoked = invoked.load(Ordering::Acquire);
                debug!(invoked, "call cancelled by caller");
                Err(ResilienceError::Cancelled { invoked })
            }
            limit = deadline => {
                let invoked = invoked.load(Ordering::Acquire);
                warn!(deadline = ?limit, invoked, "call deadline exceeded");
                Err(ResilienceError::Timeout { timeout: limit, invoked })
            }
            result = self.run_pipeline(name, options, predicate, &invoked, operation) => result,
        }
    }

    async fn run_pipeline<F, Fut, T, E, P>(
        &self,
        name: &str,
        options: &ExecuteOptions,
        predicate: &P,
        invoked: &AtomicBool,
        mut operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
        P: RetryPredicate<E> + ?Sized,
    {
        let limiter = options.rate_limiter.as_ref().map(|config| self.rate_limiter(name, config)).transpose()?;
        let bulkhead = options.bulkhead.as_ref().map(|config| self.bulkhead(name, config)).transpose()?;
        let breaker =
            options.circuit_breaker.as_ref().map(|config| self.circuit_breaker(name, config)).transpose()?;
        let retry = options.retry.clone().map(RetryPolicy::new).transpose()?;

        if let Some(limiter) = &limiter {
            limiter.wait_for_permit::<E>().await?;
        }
        let _slot = match &bulkhead {
            Some(bulkhead) => Some(bulkhead.acquire::<E>().await?),
            None => None,
        };

        let attempt_timeout = options
            .timeout
            .or_else(|| breaker.as_ref().map(|breaker| breaker.config().call_timeout))
            .unwrap_or_else(|| self.runner.default_timeout());
        let max_attempts = retry.as_ref().map_or(1, |policy| policy.config().max_attempts);
        let mut attempt = 1;
        let mut last_failure = None;
        let mut invoke = || {
            invoked.store(true, Ordering::Release);
            operation()
        };

        loop {
            let outcome = match &breaker {
                Some(breaker) => breaker.execute_with_timeout(&mut invoke, attempt_timeout).await,
                None => self.runner.run(async { invoke().await }, Some(attempt_timeout)).await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "call succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let Some(policy) = &retry else {
                return Err(error);
            };
            if !is_retryable(&error, attempt, predicate) {
                debug!(attempt, kind = %error.kind(), "error is not retryable");
                return Err(error);
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, kind = %error.kind(), error = %error, "retry attempts exhausted");
                return Err(match (error, last_failure) {
                    (ResilienceError::CircuitOpen { .. }, Some(executed)) => executed,
                    (error, _) => error,
                });
            }

            let delay = policy.delay(attempt);
            warn!(attempt, max_attempts, ?delay, kind = %error.kind(), "attempt failed, retrying");
            if error.is_execution_failure() {
                last_failure = Some(error);
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_retryable<E, P>(error: &ResilienceError<E>, attempt: u32, predicate: &P) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
    P: RetryPredicate<E> + ?Sized,
{
    match error {
        ResilienceError::CircuitOpen { .. } | ResilienceError::Timeout { .. } | ResilienceError::Panicked { .. } => {
            true
        }
        ResilienceError::OperationFailed { source } => predicate.should_retry(source, attempt),
        _ => false,
    }
}

fn get_or_create<P, Cfg>(
    map: &DashMap<String, Arc<P>>,
    kind: &'static str,
    name: &str,
    config: &Cfg,
    existing_config: impl Fn(&P) -> &Cfg,
    create: impl FnOnce() -> ConfigResult<P>,
) -> ConfigResult<Arc<P>>
where
    Cfg: PartialEq + fmt::Debug,
{
    let note_mismatch = |existing: &P| {
        if existing_config(existing) != config {
            debug!(kind, name, requested = ?config, "primitive already registered, ignoring new configuration");
        }
    };

    if let Some(existing) = map.get(name) {
        note_mismatch(existing.value());
        return Ok(Arc::clone(existing.value()));
    }

    match map.entry(name.to_string()) {
        Entry::Occupied(entry) => {
            note_mismatch(entry.get());
            Ok(Arc::clone(entry.get()))
        }
        Entry::Vacant(entry) => {
            let created = Arc::new(create()?);
            entry.insert(Arc::clone(&created));
            info!(kind, name, "registered resilience primitive");
            Ok(created)
        }
    }
}
