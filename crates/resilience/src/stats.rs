//! Read-only statistics snapshots.
//!
//! Snapshots are plain values: taking one never mutates the primitive it
//! describes, and holding one never blocks it. They serialize with serde so a
//! monitoring collaborator can export them in whatever format it likes.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit_breaker::CircuitState;
use crate::utils::serde::duration_millis;

/// Snapshot of one circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Calls refused without running the operation.
    pub rejected_requests: u64,
    pub probe_in_flight: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerStats {
    /// Fraction of executed attempts that failed, `0.0` before any attempt.
    pub fn failure_rate(&self) -> f64 {
        ratio(self.total_failures, self.total_requests)
    }
}

/// Snapshot of one sliding-window rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub max_requests: usize,
    #[serde(with = "duration_millis")]
    pub window: Duration,
    /// Grants still inside the window when the snapshot was taken.
    pub current_requests: usize,
    pub total_granted: u64,
    pub total_rejected: u64,
}

impl RateLimiterStats {
    /// Share of the window's capacity in use.
    pub fn utilization(&self) -> f64 {
        ratio(self.current_requests as u64, self.max_requests as u64)
    }
}

/// Snapshot of one bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    pub name: String,
    pub active: usize,
    pub max_concurrent: usize,
    pub available: usize,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

impl BulkheadStats {
    pub fn utilization(&self) -> f64 {
        ratio(self.active as u64, self.max_concurrent as u64)
    }

    pub fn rejection_rate(&self) -> f64 {
        ratio(self.total_rejected, self.total_admitted + self.total_rejected)
    }
}

/// Every registered primitive, keyed by dependency name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResilienceStatistics {
    pub taken_at: Option<DateTime<Utc>>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    pub rate_limiters: BTreeMap<String, RateLimiterStats>,
    pub bulkheads: BTreeMap<String, BulkheadStats>,
}

impl ResilienceStatistics {
    /// Names of breakers that are currently refusing traffic.
    pub fn open_circuits(&self) -> Vec<&str> {
        self.circuit_breakers
            .values()
            .filter(|stats| stats.state == CircuitState::Open)
            .map(|stats| stats.name.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.circuit_breakers.is_empty() && self.rate_limiters.is_empty() && self.bulkheads.is_empty()
    }

    /// Render the snapshot as pretty JSON for export.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_stats(name: &str, state: CircuitState) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: name.to_string(),
            state,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failure_threshold: 5,
            success_threshold: 3,
            total_requests: 8,
            total_failures: 2,
            total_successes: 6,
            rejected_requests: 0,
            probe_in_flight: false,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    #[test]
    fn test_rates_handle_empty_counters() {
        let bulkhead = BulkheadStats {
            name: "db".into(),
            active: 0,
            max_concurrent: 4,
            available: 4,
            total_admitted: 0,
            total_rejected: 0,
        };
        assert!(bulkhead.rejection_rate().abs() < f64::EPSILON);
        assert!(bulkhead.utilization().abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_rate() {
        let stats = breaker_stats("alpaca", CircuitState::Closed);
        assert!((stats.failure_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_open_circuits_lists_only_open() {
        let mut snapshot = ResilienceStatistics::default();
        assert!(snapshot.is_empty());

        for (name, state) in [
            ("alpaca", CircuitState::Open),
            ("fraud_api", CircuitState::HalfOpen),
            ("postgres", CircuitState::Closed),
        ] {
            snapshot.circuit_breakers.insert(name.to_string(), breaker_stats(name, state));
        }

        assert_eq!(snapshot.open_circuits(), vec!["alpaca"]);
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut snapshot = ResilienceStatistics::default();
        snapshot.rate_limiters.insert(
            "alpaca".into(),
            RateLimiterStats {
                name: "alpaca".into(),
                max_requests: 200,
                window: Duration::from_secs(60),
                current_requests: 3,
                total_granted: 3,
                total_rejected: 0,
            },
        );
        snapshot
            .circuit_breakers
            .insert("alpaca".into(), breaker_stats("alpaca", CircuitState::HalfOpen));

        let json: serde_json::Value =
            serde_json::from_str(&snapshot.to_json().expect("snapshot should serialize"))
                .expect("output should be valid JSON");

        assert_eq!(json["rate_limiters"]["alpaca"]["window"], 60000);
        assert_eq!(json["circuit_breakers"]["alpaca"]["state"], "half_open");
        assert!(json["taken_at"].is_null());
    }
}
