//! Resilience layer for calls to unreliable external services.
//!
//! Broker APIs, fraud-detection endpoints and databases fail, throttle and
//! stall. This crate wraps calls to them in five cooperating protections:
//! - **Circuit breaker** ([`CircuitBreaker`]): stops calling a dependency
//!   that keeps failing and probes it once it may have recovered
//! - **Retry** ([`RetryPolicy`]): re-runs failed attempts with fixed,
//!   exponential, linear or random backoff and optional jitter
//! - **Rate limiter** ([`RateLimiter`]): sliding-window cap on requests
//! - **Bulkhead** ([`Bulkhead`]): cap on concurrent calls
//! - **Timeout** ([`TimeoutRunner`]): per-attempt deadline with panic capture
//!
//! [`ResilienceRegistry`] keeps one instance of each primitive per dependency
//! name and composes them for a call:
//!
//! ```text
//! rate limiter -> bulkhead -> retry { circuit breaker -> timeout-bounded attempt }
//! ```
//!
//! Per-dependency profiles can be loaded from a TOML file with
//! [`settings::load`]. Every primitive exposes a serializable statistics
//! snapshot; [`ResilienceRegistry::statistics`] collects them all.
//!
//! The crate logs through `tracing` and never installs a subscriber.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod stats;
pub mod timeout;
pub mod utils;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadConfigBuilder, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitState};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, ConfigResult, ErrorKind, ResilienceError, ResilienceResult};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterConfigBuilder};
pub use registry::{ExecuteOptions, ResilienceRegistry};
pub use retry::{
    policies, retry_with_policy, RetryConfig, RetryConfigBuilder, RetryPolicy, RetryPredicate, RetryStrategy,
};
pub use settings::{DependencySettings, ResilienceSettings};
pub use stats::{BulkheadStats, CircuitBreakerStats, RateLimiterStats, ResilienceStatistics};
pub use timeout::{with_timeout, TimeoutRunner};
