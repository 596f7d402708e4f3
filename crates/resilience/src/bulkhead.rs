//! Bulkhead pattern for limiting concurrent operations
//!
//! Caps how many calls to one dependency may be in flight at once, so a slow
//! dependency cannot soak up every task in the process. Slots are handed out
//! as [`BulkheadPermit`]s which give the slot back when dropped, whether the
//! call returned, panicked or was cancelled.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::stats::BulkheadStats;
use crate::utils::serde::option_duration_millis;

/// Configuration for bulkhead behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum number of concurrent operations allowed
    pub max_concurrent: usize,
    /// How long to wait for a slot. `None` waits indefinitely and
    /// `Some(Duration::ZERO)` never waits.
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub max_wait: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10, max_wait: None }
    }
}

impl BulkheadConfig {
    /// Shorthand for a blocking bulkhead of `max_concurrent` slots.
    pub fn with_capacity(max_concurrent: usize) -> Self {
        Self { max_concurrent, ..Self::default() }
    }

    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("bulkhead", "max_concurrent must be greater than 0"));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "bulkhead",
                format!("max_concurrent must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        Ok(())
    }
}

/// Builder for BulkheadConfig
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.config.max_wait = Some(max_wait);
        self
    }

    /// Reject immediately when every slot is taken.
    pub fn fail_fast(self) -> Self {
        self.max_wait(Duration::ZERO)
    }

    pub fn wait_indefinitely(mut self) -> Self {
        self.config.max_wait = None;
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A held bulkhead slot. The slot is returned when this is dropped.
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").finish_non_exhaustive()
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Concurrency limiter for one dependency.
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            active: Arc::new(AtomicUsize::new(0)),
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Operations currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a slot without waiting.
    pub fn try_acquire<E>(&self) -> ResilienceResult<BulkheadPermit, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.admit(permit)),
            Err(_) => Err(self.reject()),
        }
    }

    /// Take a slot, waiting according to `max_wait`.
    ///
    /// Dropping the returned future while it waits gives nothing back and
    /// leaks nothing.
    pub async fn acquire<E>(&self) -> ResilienceResult<BulkheadPermit, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.config.max_wait {
            Some(wait) if wait.is_zero() => self.try_acquire(),
            Some(wait) => {
                match tokio::time::timeout(wait, Arc::clone(&self.semaphore).acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(self.admit(permit)),
                    Ok(Err(_)) | Err(_) => Err(self.reject()),
                }
            }
            None => match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => Ok(self.admit(permit)),
                Err(_) => Err(self.reject()),
            },
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        BulkheadPermit { _permit: permit, active: Arc::clone(&self.active) }
    }

    fn reject<E>(&self) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        debug!(bulkhead = %self.name, capacity = self.config.max_concurrent, "bulkhead full, rejecting");
        ResilienceError::BulkheadFull { name: self.name.clone(), capacity: self.config.max_concurrent }
    }

    /// Run `operation` while holding a slot.
    #[instrument(skip(self, operation), fields(bulkhead = %self.name, active = self.active()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _permit = self.acquire().await?;
        operation().await.map_err(|source| {
            warn!("operation failed inside bulkhead");
            ResilienceError::OperationFailed { source }
        })
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.name.clone(),
            active: self.active(),
            max_concurrent: self.config.max_concurrent,
            available: self.available(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::ErrorKind;

    type TestResult<T> = ResilienceResult<T, std::io::Error>;

    #[test]
    fn test_config_validation() {
        assert!(BulkheadConfig::builder().max_concurrent(0).build().is_err());
        let config = BulkheadConfig::builder().max_concurrent(4).fail_fast().build().unwrap();
        assert_eq!(config.max_wait, Some(Duration::ZERO));
        assert_eq!(BulkheadConfig::with_capacity(2).max_wait, None);
    }

    #[test]
    fn test_permit_drop_releases_slot() {
        let bulkhead = Bulkhead::new("postgres", BulkheadConfig::with_capacity(2)).unwrap();

        let first: TestResult<BulkheadPermit> = bulkhead.try_acquire();
        let second: TestResult<BulkheadPermit> = bulkhead.try_acquire();
        let first = first.unwrap();
        let _second = second.unwrap();
        assert_eq!(bulkhead.active(), 2);
        assert_eq!(bulkhead.available(), 0);

        let third: TestResult<BulkheadPermit> = bulkhead.try_acquire();
        assert_eq!(third.map_err(|e| e.kind()).err(), Some(ErrorKind::BulkheadFull));

        drop(first);
        assert_eq!(bulkhead.active(), 1);
        assert_eq!(bulkhead.available(), 1);

        let stats = bulkhead.stats();
        assert_eq!(stats.total_admitted, 2);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.max_concurrent, 2);
    }

    #[tokio::test]
    async fn test_fail_fast_mode() {
        let config = BulkheadConfig::builder().max_concurrent(1).fail_fast().build().unwrap();
        let bulkhead = Bulkhead::new("fraud_api", config).unwrap();

        let held: TestResult<BulkheadPermit> = bulkhead.acquire().await;
        let _held = held.unwrap();
        let rejected: TestResult<BulkheadPermit> = bulkhead.acquire().await;
        assert!(matches!(rejected, Err(ResilienceError::BulkheadFull { capacity: 1, .. })));
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let config = BulkheadConfig::builder()
            .max_concurrent(1)
            .max_wait(Duration::from_millis(20))
            .build()
            .unwrap();
        let bulkhead = Bulkhead::new("fraud_api", config).unwrap();

        let _held: BulkheadPermit = bulkhead.try_acquire::<std::io::Error>().unwrap();
        let started = std::time::Instant::now();
        let waited: TestResult<BulkheadPermit> = bulkhead.acquire().await;
        assert!(waited.is_err());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(bulkhead.active(), 1);
    }

    #[tokio::test]
    async fn test_waiter_admitted_when_slot_frees() {
        let bulkhead = Arc::new(Bulkhead::new("postgres", BulkheadConfig::with_capacity(1)).unwrap());
        let held = bulkhead.try_acquire::<std::io::Error>().unwrap();

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                let permit: TestResult<BulkheadPermit> = bulkhead.acquire().await;
                permit.map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(bulkhead.active(), 0);
    }

    #[tokio::test]
    async fn test_execute_maps_error_and_releases() {
        let bulkhead = Bulkhead::new("postgres", BulkheadConfig::with_capacity(1)).unwrap();
        let result: TestResult<()> =
            bulkhead.execute(|| async { Err(std::io::Error::other("deadlock detected")) }).await;
        assert_eq!(result.map_err(|e| e.kind()).err(), Some(ErrorKind::OperationFailed));
        assert_eq!(bulkhead.active(), 0);
        assert_eq!(bulkhead.available(), 1);
    }

    /// Validates the concurrency bound under load.
    ///
    /// Assertions:
    /// - The observed peak of concurrently running operations never exceeds
    ///   `max_concurrent`.
    /// - Every slot is returned once all operations finish.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_capacity() {
        let bulkhead = Arc::new(Bulkhead::new("broker", BulkheadConfig::with_capacity(3)).unwrap());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let bulkhead = Arc::clone(&bulkhead);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    bulkhead
                        .execute(move || async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, std::io::Error>(())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(bulkhead.active(), 0);
        assert_eq!(bulkhead.stats().total_admitted, 24);
    }
}
