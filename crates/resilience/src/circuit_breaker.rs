//! Circuit breaker
//!
//! Stops calling a dependency after repeated failures and lets traffic back in
//! gradually once it has had time to recover.
//!
//! # States
//!
//! - **Closed**: calls run. Consecutive failures are counted and any success
//!   clears the count. Reaching `failure_threshold` opens the circuit.
//! - **Open**: calls are rejected with [`ResilienceError::CircuitOpen`] without
//!   running. Once `recovery_timeout` has passed since the last failure the
//!   next call is admitted as a probe and the circuit becomes half-open.
//! - **HalfOpen**: exactly one probe runs at a time; concurrent callers are
//!   rejected. `success_threshold` consecutive probe successes close the
//!   circuit, and any probe failure (error, panic or timeout) re-opens it.
//!
//! Admission and outcome recording each take the breaker's mutex once. The
//! operation itself always runs outside the lock.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{panic_message, ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::stats::CircuitBreakerStats;
use crate::timeout::with_timeout;
use crate::utils::serde::duration_millis;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A single probe at a time is testing recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
    /// Consecutive probe successes in HalfOpen that close the circuit.
    pub success_threshold: u32,
    /// Deadline for each attempt run through [`CircuitBreaker::execute`].
    #[serde(with = "duration_millis")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker", "failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker", "success_threshold must be greater than 0"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::invalid("circuit_breaker", "call_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    // Bumped on every state change; outcomes tagged with an older value are
    // only counted in the totals.
    generation: u64,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    rejected_requests: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            probe_in_flight: false,
            generation: 0,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            rejected_requests: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.probe_in_flight = false;
        self.consecutive_successes = 0;
        if to != CircuitState::Open {
            self.consecutive_failures = 0;
        }
    }

    fn recovery_elapsed(&self, now: Instant, recovery_timeout: Duration) -> bool {
        self.last_failure
            .map_or(true, |failed_at| now.saturating_duration_since(failed_at) >= recovery_timeout)
    }
}

/// Permission to run one call, returned by admission.
///
/// Dropping it without settling (the caller's future was dropped mid-call)
/// frees the probe slot so the half-open circuit is not wedged.
struct Admission<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl<C: Clock> Drop for Admission<'_, C> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

/// Circuit breaker guarding one dependency.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: C,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .field("consecutive_successes", &inner.consecutive_successes)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a breaker with the default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::build(name.into(), CircuitBreakerConfig::default(), SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker on a custom clock (tests use [`crate::MockClock`]).
    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::build(name.into(), config, clock))
    }

    fn build(name: String, config: CircuitBreakerConfig, clock: C) -> Self {
        Self { name, config, inner: Mutex::new(BreakerState::new()), clock }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Does not advance Open to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call made now would be admitted, without changing state.
    pub fn is_call_permitted(&self) -> bool {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.recovery_elapsed(now, self.config.recovery_timeout),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Run `operation` bounded by the configured `call_timeout`.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_with_timeout(operation, self.config.call_timeout).await
    }

    /// Run `operation` bounded by `timeout`.
    ///
    /// Errors, panics and timeouts all count as failures. A rejected call
    /// returns [`ResilienceError::CircuitOpen`] without running `operation`.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        operation: F,
        timeout: Duration,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(admission) = self.admit() else {
            return Err(ResilienceError::CircuitOpen { name: self.name.clone() });
        };

        let result = with_timeout(timeout, async move { operation().await }).await;
        self.settle(admission, result.is_ok());
        result
    }

    /// Synchronous variant of [`execute`](Self::execute) with no deadline.
    /// Panics are caught and counted as failures.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(admission) = self.admit() else {
            return Err(ResilienceError::CircuitOpen { name: self.name.clone() });
        };

        let result = match std::panic::catch_unwind(AssertUnwindSafe(operation)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ResilienceError::OperationFailed { source }),
            Err(payload) => Err(ResilienceError::Panicked { message: panic_message(payload.as_ref()) }),
        };
        self.settle(admission, result.is_ok());
        result
    }

    fn admit(&self) -> Option<Admission<'_, C>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if !inner.recovery_elapsed(now, self.config.recovery_timeout) {
                    inner.rejected_requests += 1;
                    debug!(breaker = %self.name, "circuit open, rejecting call");
                    return None;
                }
                inner.transition(CircuitState::HalfOpen);
                info!(breaker = %self.name, "circuit half-open, admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.rejected_requests += 1;
                    debug!(breaker = %self.name, "probe already in flight, rejecting call");
                    return None;
                }
                true
            }
        };

        if probe {
            inner.probe_in_flight = true;
        }
        Some(Admission { breaker: self, generation: inner.generation, probe, settled: false })
    }

    fn settle(&self, mut admission: Admission<'_, C>, succeeded: bool) {
        admission.settled = true;
        let now = self.clock.now();
        let wall = self.clock.utc_now();
        let mut inner = self.inner.lock();

        inner.total_requests += 1;
        if succeeded {
            inner.total_successes += 1;
            inner.last_success_at = Some(wall);
        } else {
            inner.total_failures += 1;
            inner.last_failure_at = Some(wall);
        }

        if inner.generation != admission.generation {
            debug!(breaker = %self.name, succeeded, "outcome from before the last transition, counted only in totals");
            return;
        }
        if admission.probe {
            inner.probe_in_flight = false;
        }

        match (inner.state, succeeded) {
            (CircuitState::Closed, true) => inner.consecutive_failures = 0,
            (CircuitState::Closed, false) => {
                inner.last_failure = Some(now);
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open);
                    warn!(breaker = %self.name, failures = inner.consecutive_failures, "circuit opened");
                }
            }
            (CircuitState::HalfOpen, true) if admission.probe => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    let successes = inner.consecutive_successes;
                    inner.transition(CircuitState::Closed);
                    info!(breaker = %self.name, successes, "circuit closed after successful probes");
                }
            }
            (CircuitState::HalfOpen, false) if admission.probe => {
                inner.last_failure = Some(now);
                inner.transition(CircuitState::Open);
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            _ => {}
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            debug!(breaker = %self.name, "probe abandoned before completion");
        }
    }

    /// Manually close the circuit. Cumulative totals are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        info!(breaker = %self.name, "circuit manually reset to closed");
    }

    /// Trip the circuit open as if the failure threshold had just been hit.
    pub fn force_open(&self) {
        let now = self.clock.now();
        let wall = self.clock.utc_now();
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Open);
        inner.last_failure = Some(now);
        inner.last_failure_at = Some(wall);
        warn!(breaker = %self.name, "circuit forced open");
    }

    /// Snapshot of counters and state.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejected_requests: inner.rejected_requests,
            probe_in_flight: inner.probe_in_flight,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
        }
    }
}
