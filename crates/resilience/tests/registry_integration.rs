//! Integration tests for the composed execution path
//!
//! Exercises `ResilienceRegistry::execute` end to end: idempotent
//! registration, retry over an open circuit, cancellation and panic handling
//! around bulkhead slots, rate limiting, and statistics export.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tradeguard_resilience::{
    policies, BulkheadConfig, CircuitBreakerConfig, CircuitState, ErrorKind, ExecuteOptions, MockClock,
    RateLimiterConfig, ResilienceError, ResilienceRegistry, RetryConfig,
};

#[derive(Debug)]
struct ApiError(&'static str);

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ApiError {}

fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(attempts)
        .fixed_backoff(Duration::from_millis(1))
        .no_jitter()
        .build()
        .expect("retry config should be valid")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Validates that concurrent first use of a name creates exactly one breaker.
///
/// # Test Steps
/// 1. Race 32 tasks calling `circuit_breaker("alpaca", ..)`
/// 2. Confirm every task received the same instance
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_get_or_create_is_idempotent() {
    let registry = Arc::new(ResilienceRegistry::new());

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let config = CircuitBreakerConfig::builder().failure_threshold(1 + i % 4).build().unwrap();
                registry.circuit_breaker("alpaca", &config).unwrap()
            })
        })
        .collect();

    let mut breakers = Vec::new();
    for task in tasks {
        breakers.push(task.await.unwrap());
    }

    let first = &breakers[0];
    assert!(breakers.iter().all(|breaker| Arc::ptr_eq(breaker, first)));
    assert_eq!(registry.statistics().circuit_breakers.len(), 1);
}

/// Validates that retry wrapping an open breaker burns attempts without
/// running the operation.
///
/// # Test Steps
/// 1. Trip the `alpaca` breaker open (long recovery timeout)
/// 2. Execute with `max_attempts = 4`
/// 3. Confirm `CircuitOpen` comes back, the operation never ran, and four
///    rejections were recorded
#[tokio::test]
async fn test_retry_over_open_breaker_consumes_attempts() {
    init_tracing();
    let clock = MockClock::new();
    let registry = ResilienceRegistry::with_clock(clock);
    let breaker_config =
        CircuitBreakerConfig::builder().failure_threshold(1).recovery_timeout(Duration::from_secs(60)).build().unwrap();
    registry.circuit_breaker("alpaca", &breaker_config).unwrap().force_open();

    let options = ExecuteOptions::new().with_circuit_breaker(breaker_config).with_retry(fast_retry(4));
    let invoked = AtomicU32::new(0);

    let result = registry
        .execute("alpaca", &options, || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApiError>(()) }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    let stats = registry.get_circuit_breaker("alpaca").unwrap().stats();
    assert_eq!(stats.rejected_requests, 4);
    assert_eq!(stats.total_requests, 0);
}

/// Validates the breaker opens mid-retry and the last real failure is
/// returned instead of the rejection.
///
/// # Test Steps
/// 1. `failure_threshold = 2`, `max_attempts = 5`, broker always answers 502
/// 2. Two attempts run and open the circuit; the rest are rejected
/// 3. Confirm the 502 comes back as an execution failure
#[tokio::test]
async fn test_breaker_opens_during_retry() {
    let registry = ResilienceRegistry::with_clock(MockClock::new());
    let options = ExecuteOptions::new()
        .with_circuit_breaker(CircuitBreakerConfig::builder().failure_threshold(2).build().unwrap())
        .with_retry(fast_retry(5));
    let invoked = AtomicU32::new(0);

    let result = registry
        .execute("fraud_api", &options, || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ApiError("502 Bad Gateway")) }
        })
        .await;

    let error = result.expect_err("every attempt fails");
    assert_eq!(error.kind(), ErrorKind::OperationFailed);
    assert_eq!(error.operation_error().map(|e| e.0), Some("502 Bad Gateway"));
    assert!(error.is_execution_failure());
    assert!(!error.is_admission_rejection());
    assert_eq!(invoked.load(Ordering::SeqCst), 2);

    let breaker = registry.get_circuit_breaker("fraud_api").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.stats().rejected_requests, 3);
}

/// Validates that cancelling a caller blocked on a full bulkhead leaks no
/// slot.
///
/// # Test Steps
/// 1. One-slot bulkhead, held by a long-running call
/// 2. Second call waits for the slot; cancel its token
/// 3. Confirm `Cancelled`, then finish the first call
/// 4. Confirm the slot is free and a third call is admitted
#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_while_waiting_releases_nothing() {
    let registry = Arc::new(ResilienceRegistry::new());
    let bulkhead = BulkheadConfig::with_capacity(1);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

    let holder = {
        let registry = Arc::clone(&registry);
        let options = ExecuteOptions::new().with_bulkhead(bulkhead.clone());
        tokio::spawn(async move {
            let mut channels = Some((started_tx, release_rx));
            registry
                .execute("postgres", &options, move || {
                    let channels = channels.take();
                    async move {
                        if let Some((started, release)) = channels {
                            let _ = started.send(());
                            let _ = release.await;
                        }
                        Ok::<_, ApiError>(())
                    }
                })
                .await
        })
    };
    started_rx.await.unwrap();

    let token = CancellationToken::new();
    let waiter = {
        let registry = Arc::clone(&registry);
        let options = ExecuteOptions::new().with_bulkhead(bulkhead.clone()).with_cancellation(token.clone());
        tokio::spawn(async move { registry.execute("postgres", &options, || async { Ok::<_, ApiError>(()) }).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    let cancelled = waiter.await.unwrap();
    assert!(matches!(cancelled, Err(ResilienceError::Cancelled { invoked: false })));
    assert!(cancelled.as_ref().is_err_and(|e| e.is_admission_rejection()));

    release_tx.send(()).unwrap();
    assert!(holder.await.unwrap().is_ok());

    let slot = registry.get_bulkhead("postgres").unwrap();
    assert_eq!(slot.active(), 0);
    assert_eq!(slot.available(), 1);

    let third = registry
        .execute("postgres", &ExecuteOptions::new().with_bulkhead(bulkhead), || async { Ok::<_, ApiError>(7) })
        .await;
    assert_eq!(third.ok(), Some(7));
}

/// Validates a cancel that lands mid-attempt is reported as having reached
/// the dependency.
#[tokio::test]
async fn test_cancellation_after_invocation_is_execution_failure() {
    let registry = ResilienceRegistry::new();
    let token = CancellationToken::new();
    let options = ExecuteOptions::new().with_cancellation(token.clone());
    let invoked = AtomicU32::new(0);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let result = registry
        .execute("alpaca", &options, || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ApiError>("order-1")
            }
        })
        .await;
    canceller.await.unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(ResilienceError::Cancelled { invoked: true })));
    let error = result.expect_err("cancelled");
    assert!(error.is_execution_failure());
    assert!(!error.is_admission_rejection());
}

/// Validates a deadline that fires while waiting for a rate-limit permit is
/// reported as a rejection.
///
/// # Test Steps
/// 1. One request per minute on a frozen clock, overall deadline 50 ms
/// 2. First call takes the only permit
/// 3. Second call waits for a permit until the deadline fires
/// 4. Confirm `Timeout` with `invoked: false` and that the operation ran once
#[tokio::test]
async fn test_deadline_before_invocation_is_rejection() {
    let registry = ResilienceRegistry::with_clock(MockClock::new());
    let options = ExecuteOptions::new()
        .with_rate_limiter(RateLimiterConfig::per_window(1, Duration::from_secs(60)))
        .with_deadline(Duration::from_millis(50));
    let invoked = AtomicU32::new(0);

    let first = registry
        .execute("alpaca", &options, || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApiError>(()) }
        })
        .await;
    assert!(first.is_ok());

    let second = registry
        .execute("alpaca", &options, || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApiError>(()) }
        })
        .await;

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert!(matches!(second, Err(ResilienceError::Timeout { invoked: false, .. })));
    let error = second.expect_err("deadline exceeded");
    assert!(error.is_admission_rejection());
    assert!(!error.is_execution_failure());
}

/// Validates a deadline that fires during a running attempt is reported as an
/// execution failure.
#[tokio::test]
async fn test_deadline_after_invocation_is_execution_failure() {
    let registry = ResilienceRegistry::new();
    let options = ExecuteOptions::new().with_deadline(Duration::from_millis(30));

    let result = registry
        .execute("postgres", &options, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ApiError>(())
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::Timeout { invoked: true, .. })));
    let error = result.expect_err("deadline exceeded");
    assert!(error.is_execution_failure());
    assert!(!error.is_admission_rejection());
}

/// Validates a panicking operation becomes `Panicked` and frees its slot.
#[tokio::test]
async fn test_panic_releases_bulkhead_slot() {
    let registry = ResilienceRegistry::new();
    let options = ExecuteOptions::new().with_bulkhead(BulkheadConfig::builder().max_concurrent(1).fail_fast().build().unwrap());

    async fn score_transaction() -> Result<f64, ApiError> {
        panic!("model weights missing")
    }

    let result = registry.execute("fraud_model", &options, score_transaction).await;
    match result {
        Err(ResilienceError::Panicked { message }) => assert!(message.contains("model weights missing")),
        other => panic!("expected Panicked, got {other:?}"),
    }

    let bulkhead = registry.get_bulkhead("fraud_model").unwrap();
    assert_eq!(bulkhead.active(), 0);
    let again = registry.execute("fraud_model", &options, || async { Ok::<_, ApiError>(0.02) }).await;
    assert_eq!(again.ok(), Some(0.02));
}

/// Validates fail-fast rate limiting through the registry.
#[tokio::test]
async fn test_rate_limit_rejects_before_running() {
    let registry = ResilienceRegistry::with_clock(MockClock::new());
    let limiter = RateLimiterConfig::builder()
        .max_requests(2)
        .window(Duration::from_secs(60))
        .max_wait(Duration::ZERO)
        .build()
        .unwrap();
    let options = ExecuteOptions::new().with_rate_limiter(limiter).with_retry(fast_retry(3));
    let invoked = AtomicU32::new(0);

    for _ in 0..2 {
        let ok = registry
            .execute("alpaca", &options, || {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ApiError>(()) }
            })
            .await;
        assert!(ok.is_ok());
    }

    let limited = registry
        .execute("alpaca", &options, || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApiError>(()) }
        })
        .await;
    assert!(matches!(limited, Err(ResilienceError::RateLimitExceeded { max_requests: 2, .. })));
    assert!(limited.as_ref().is_err_and(|e| e.is_admission_rejection()));
    assert_eq!(invoked.load(Ordering::SeqCst), 2);
}

/// Validates that the caller's predicate decides which operation errors are
/// retried.
#[tokio::test]
async fn test_predicate_limits_retries() {
    let registry = ResilienceRegistry::new();
    let options = ExecuteOptions::new().with_retry(fast_retry(5));
    let transient = policies::PredicateRetry::new(|e: &ApiError| e.0.starts_with("503"));
    let invoked = AtomicU32::new(0);

    let result: Result<(), ResilienceError<ApiError>> = registry
        .execute_with_predicate("alpaca", &options, &transient, || {
            let n = invoked.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiError("503 Service Unavailable"))
                } else {
                    Err(ApiError("422 Unprocessable Entity"))
                }
            }
        })
        .await;

    let error = result.expect_err("should fail");
    assert_eq!(error.operation_error().map(|e| e.0), Some("422 Unprocessable Entity"));
    assert_eq!(invoked.load(Ordering::SeqCst), 3);
}

/// Validates the statistics snapshot covers every primitive and exports to
/// JSON.
#[tokio::test]
async fn test_statistics_export() {
    let registry = ResilienceRegistry::with_clock(MockClock::new());
    let options = ExecuteOptions::new()
        .with_circuit_breaker(CircuitBreakerConfig::default())
        .with_rate_limiter(RateLimiterConfig::per_window(200, Duration::from_secs(60)))
        .with_bulkhead(BulkheadConfig::with_capacity(10));

    for _ in 0..3 {
        let _ = registry.execute("alpaca", &options, || async { Ok::<_, ApiError>(()) }).await;
    }

    let snapshot = registry.statistics();
    assert_eq!(snapshot.circuit_breakers["alpaca"].total_successes, 3);
    assert_eq!(snapshot.rate_limiters["alpaca"].current_requests, 3);
    assert_eq!(snapshot.bulkheads["alpaca"].total_admitted, 3);
    assert!(snapshot.open_circuits().is_empty());

    let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(json["circuit_breakers"]["alpaca"]["state"], "closed");
    assert_eq!(json["rate_limiters"]["alpaca"]["window"], 60_000);
    assert_eq!(json["bulkheads"]["alpaca"]["active"], 0);
}
