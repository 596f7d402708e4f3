//! Sliding-window rate limiter
//!
//! Grants at most `max_requests` permits in any window of length `window`.
//! The limiter remembers the instant of every grant still inside the window;
//! older ones are dropped on each check, so memory stays bounded by
//! `max_requests`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::stats::RateLimiterStats;
use crate::utils::serde::{duration_millis, option_duration_millis};

/// Configuration for [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Permits granted per window.
    pub max_requests: usize,
    /// Length of the sliding window.
    #[serde(with = "duration_millis")]
    pub window: Duration,
    /// Sleep between attempts in [`RateLimiter::wait_for_permit`].
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Longest [`RateLimiter::wait_for_permit`] may wait. `None` waits until
    /// granted, `Some(Duration::ZERO)` fails fast.
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub max_wait: Option<Duration>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            max_wait: None,
        }
    }
}

impl RateLimiterConfig {
    /// Shorthand for `max_requests` per `window` with the remaining defaults.
    pub fn per_window(max_requests: usize, window: Duration) -> Self {
        Self { max_requests, window, ..Self::default() }
    }

    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid("rate_limiter", "max_requests must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("rate_limiter", "window must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("rate_limiter", "poll_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`RateLimiterConfig`].
#[derive(Debug, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.config.max_wait = Some(max_wait);
        self
    }

    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Sliding-window rate limiter for one dependency.
///
/// ```rust
/// use std::time::Duration;
///
/// use tradeguard_resilience::{RateLimiter, RateLimiterConfig};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = RateLimiter::new("alpaca", RateLimiterConfig::per_window(2, Duration::from_secs(1)))?;
/// assert!(limiter.acquire());
/// assert!(limiter.acquire());
/// assert!(!limiter.acquire());
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter<C: Clock = SystemClock> {
    name: String,
    config: RateLimiterConfig,
    grants: Mutex<VecDeque<std::time::Instant>>,
    total_granted: AtomicU64,
    total_rejected: AtomicU64,
    clock: C,
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("current_requests", &self.grants.lock().len())
            .finish_non_exhaustive()
    }
}

impl RateLimiter<SystemClock> {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a limiter on a custom clock.
    pub fn with_clock(name: impl Into<String>, config: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            grants: Mutex::new(VecDeque::with_capacity(config.max_requests.min(1024))),
            config,
            total_granted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take a permit if the window has room. Never blocks.
    pub fn acquire(&self) -> bool {
        if self.try_grant() {
            true
        } else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(limiter = %self.name, "rate limit reached");
            false
        }
    }

    fn try_grant(&self) -> bool {
        let now = self.clock.now();
        let mut grants = self.grants.lock();
        evict_expired(&mut grants, now, self.config.window);

        if grants.len() < self.config.max_requests {
            grants.push_back(now);
            self.total_granted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Wait until a permit is granted, polling every `poll_interval`.
    ///
    /// Fails with [`ResilienceError::RateLimitExceeded`] once `max_wait` has
    /// passed without a grant.
    #[instrument(skip(self), fields(limiter = %self.name))]
    pub async fn wait_for_permit<E>(&self) -> ResilienceResult<(), E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let started = tokio::time::Instant::now();
        let mut polls: u64 = 0;

        loop {
            if self.try_grant() {
                if polls > 0 {
                    debug!(waited = ?started.elapsed(), "permit granted after waiting");
                }
                return Ok(());
            }

            let mut pause = self.config.poll_interval;
            if let Some(max_wait) = self.config.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(?waited, max_requests = self.config.max_requests, "gave up waiting for rate limit permit");
                    return Err(self.exceeded());
                }
                pause = pause.min(max_wait - waited);
            }

            polls += 1;
            tokio::time::sleep(pause).await;
        }
    }

    fn exceeded<E>(&self) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ResilienceError::RateLimitExceeded {
            name: self.name.clone(),
            max_requests: self.config.max_requests,
            window: self.config.window,
        }
    }

    /// Grants still inside the window.
    pub fn current_requests(&self) -> usize {
        let now = self.clock.now();
        let mut grants = self.grants.lock();
        evict_expired(&mut grants, now, self.config.window);
        grants.len()
    }

    /// Forget every grant. Counters are kept.
    pub fn reset(&self) {
        self.grants.lock().clear();
        debug!(limiter = %self.name, "rate limiter window cleared");
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.name.clone(),
            max_requests: self.config.max_requests,
            window: self.config.window,
            current_requests: self.current_requests(),
            total_granted: self.total_granted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Drop grants at or before `now - window`.
fn evict_expired(grants: &mut VecDeque<std::time::Instant>, now: std::time::Instant, window: Duration) {
    while let Some(&oldest) = grants.front() {
        if now.saturating_duration_since(oldest) >= window {
            grants.pop_front();
        } else {
            break;
        }
    }
}
