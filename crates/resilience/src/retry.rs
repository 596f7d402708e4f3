//! Retry with configurable backoff
//!
//! A [`RetryPolicy`] re-runs a failing operation up to
//! [`RetryConfig::max_attempts`] times, sleeping between attempts for a delay
//! computed from the configured [`RetryStrategy`]. Which errors are worth
//! retrying is decided by a [`RetryPredicate`]; see [`policies`] for the
//! stock ones.
//!
//! Delays are computed per attempt (1-based) as:
//!
//! | Strategy | Delay before jitter |
//! |----------|---------------------|
//! | `Fixed` | `base_delay` |
//! | `Exponential` | `base_delay * backoff_multiplier^(attempt - 1)` |
//! | `Linear` | `base_delay * attempt` |
//! | `Random` | uniform in `[base_delay, base_delay * attempt]` |
//!
//! With `jitter` enabled the delay is scaled by a uniform factor in
//! `[0.5, 1.5]`, and the result is always clamped to `max_delay`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::utils::serde::duration_millis;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay multiplied by `backoff_multiplier` after every attempt.
    Exponential,
    /// Delay grows by `base_delay` after every attempt.
    Linear,
    /// Delay drawn uniformly between `base_delay` and `base_delay * attempt`.
    Random,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Exponential => write!(f, "exponential"),
            Self::Linear => write!(f, "linear"),
            Self::Random => write!(f, "random"),
        }
    }
}

/// Retry behaviour for one dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Hard upper bound on attempts, first attempt included.
    pub max_attempts: u32,
    /// Starting delay.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Ceiling applied after strategy and jitter.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth strategy.
    pub strategy: RetryStrategy,
    /// Growth factor for [`RetryStrategy::Exponential`].
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry", "max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(ConfigError::invalid(
                "retry",
                format!("backoff_multiplier must be a finite value above 1, got {}", self.backoff_multiplier),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                "retry",
                format!(
                    "max_delay ({:?}) must not be shorter than base_delay ({:?})",
                    self.max_delay, self.base_delay
                ),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`RetryConfig`].
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn fixed_backoff(self, delay: Duration) -> Self {
        self.strategy(RetryStrategy::Fixed).base_delay(delay)
    }

    pub fn linear_backoff(self, base_delay: Duration) -> Self {
        self.strategy(RetryStrategy::Linear).base_delay(base_delay)
    }

    pub fn exponential_backoff(mut self, base_delay: Duration, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self.strategy(RetryStrategy::Exponential).base_delay(base_delay)
    }

    pub fn random_backoff(self, base_delay: Duration) -> Self {
        self.strategy(RetryStrategy::Random).base_delay(base_delay)
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn no_jitter(self) -> Self {
        self.jitter(false)
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Decides whether a failed attempt should be retried.
pub trait RetryPredicate<E> {
    /// `attempt` is the 1-based number of the attempt that just failed.
    fn should_retry(&self, error: &E, attempt: u32) -> bool;
}

/// Stock retry predicates.
pub mod policies {
    use super::RetryPredicate;

    /// Retry every error. Equivalent to an empty "retryable errors" set.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPredicate<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> bool {
            true
        }
    }

    /// Never retry; the first failure is returned as-is.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPredicate<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> bool {
            false
        }
    }

    /// Retry only errors accepted by a closure.
    ///
    /// ```rust
    /// use tradeguard_resilience::policies::PredicateRetry;
    ///
    /// let transient_only =
    ///     PredicateRetry::new(|e: &std::io::Error| e.kind() == std::io::ErrorKind::TimedOut);
    /// # let _ = transient_only;
    /// ```
    #[derive(Clone, Copy)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F> std::fmt::Debug for PredicateRetry<F> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PredicateRetry").finish_non_exhaustive()
        }
    }

    impl<F, E> RetryPredicate<E> for PredicateRetry<F>
    where
        F: Fn(&E) -> bool,
    {
        fn should_retry(&self, error: &E, _attempt: u32) -> bool {
            (self.predicate)(error)
        }
    }
}

/// Executes operations under a validated [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Validate `config` and wrap it.
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to sleep after `attempt` failed, jitter and ceiling applied.
    /// Attempt `0` yields no delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        let mut secs = self.strategy_secs(attempt, &mut rng);
        if self.config.jitter {
            secs *= rng.gen_range(0.5..=1.5);
        }
        self.clamp(secs)
    }

    /// Delay for `attempt` before jitter, clamped to `max_delay`.
    ///
    /// Deterministic for every strategy except [`RetryStrategy::Random`].
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let secs = self.strategy_secs(attempt, &mut rand::thread_rng());
        self.clamp(secs)
    }

    fn strategy_secs<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> f64 {
        let base = self.config.base_delay.as_secs_f64();
        match self.config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * self.config.backoff_multiplier.powi(exponent)
            }
            RetryStrategy::Linear => base * f64::from(attempt),
            RetryStrategy::Random => {
                let upper = base * f64::from(attempt);
                if upper > base {
                    rng.gen_range(base..=upper)
                } else {
                    base
                }
            }
        }
    }

    fn clamp(&self, secs: f64) -> Duration {
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            self.config.max_delay
        } else if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Retry every failure until success or `max_attempts`.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with_retry(operation, &policies::AlwaysRetry).await
    }

    /// Run `operation` until it succeeds, `predicate` rejects its error, or
    /// `max_attempts` is reached. The returned error is always the one from
    /// the last attempt made.
    #[instrument(skip_all, fields(max_attempts = self.config.max_attempts, strategy = %self.config.strategy))]
    pub async fn execute_with_retry<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        predicate: &P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: RetryPredicate<E> + ?Sized,
    {
        let max_attempts = self.config.max_attempts;
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !predicate.should_retry(&error, attempt) {
                        debug!(attempt, error = %error, "error is not retryable");
                        return Err(error);
                    }
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %error, "retry attempts exhausted");
                        return Err(error);
                    }

                    let delay = self.delay(attempt);
                    warn!(attempt, max_attempts, ?delay, error = %error, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// One-shot helper: validate `config` and run `operation` under it.
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    predicate: &P,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display + From<ConfigError>,
    P: RetryPredicate<E> + ?Sized,
{
    let policy = RetryPolicy::new(config)?;
    policy.execute_with_retry(operation, predicate).await
}
