//! Provider health tracking
//!
//! Rolling metrics and circuit-breaker state per RPC endpoint. Selection
//! ranks providers by a composite priority score; an open circuit excludes
//! a provider outright until its recovery window elapses.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Health status of a single provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Failing,
    CircuitOpen,
    Offline,
}

/// Rolling request metrics for one provider
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponential moving average (alpha = 0.1)
    pub average_latency_ms: f64,
    pub last_latency_ms: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl ProviderMetrics {
    pub fn record_success(&mut self, latency_ms: f64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_latency_ms = latency_ms;

        if self.average_latency_ms == 0.0 {
            self.average_latency_ms = latency_ms;
        } else {
            self.average_latency_ms = 0.9 * self.average_latency_ms + 0.1 * latency_ms;
        }
    }

    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }
}

/// Runtime health state for one provider
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub status: ProviderStatus,
    pub metrics: ProviderMetrics,
    pub circuit_open_until: Option<DateTime<Utc>>,
    /// Base priority from configuration (lower = preferred)
    base_priority: u32,
    failure_threshold: u32,
}

impl ProviderHealth {
    pub fn new(base_priority: u32, failure_threshold: u32) -> Self {
        Self {
            status: ProviderStatus::Healthy,
            metrics: ProviderMetrics::default(),
            circuit_open_until: None,
            base_priority,
            failure_threshold,
        }
    }

    /// Whether this provider may be selected right now.
    ///
    /// Expired circuit windows are cleared as a side effect, making the
    /// provider selectable again after `recovery_timeout`.
    pub fn is_available(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(until) = self.circuit_open_until {
            if now < until {
                return false;
            }
            // Recovery window elapsed: half-open, try again.
            self.circuit_open_until = None;
            self.status = ProviderStatus::Degraded;
            self.metrics.consecutive_failures = 0;
        }
        self.status != ProviderStatus::Offline
    }

    /// Composite selection score; lowest wins.
    pub fn priority_score(&self) -> f64 {
        let status_penalty = match self.status {
            ProviderStatus::Healthy => 0.0,
            ProviderStatus::Degraded => 1.0,
            ProviderStatus::Failing => 3.0,
            ProviderStatus::CircuitOpen | ProviderStatus::Offline => 10.0,
        };
        let latency_penalty = self.metrics.average_latency_ms / 1000.0;
        let failure_penalty = 0.5 * self.metrics.consecutive_failures as f64;

        self.base_priority as f64 + status_penalty + latency_penalty + failure_penalty
    }

    /// Record a successful request and re-evaluate status from latency.
    pub fn on_success(&mut self, latency_ms: f64, degraded_above_ms: u64, healthy_below_ms: u64) {
        self.metrics.record_success(latency_ms);

        if latency_ms > degraded_above_ms as f64 {
            self.status = ProviderStatus::Degraded;
        } else if latency_ms < healthy_below_ms as f64 {
            self.status = ProviderStatus::Healthy;
        }
        // Between the two thresholds the current status is kept.
    }

    /// Record a failed request; opens the circuit at the failure threshold.
    pub fn on_failure(&mut self, now: DateTime<Utc>, recovery_secs: u64) {
        self.metrics.record_failure();

        if self.metrics.consecutive_failures >= self.failure_threshold {
            self.status = ProviderStatus::CircuitOpen;
            self.circuit_open_until = Some(now + Duration::seconds(recovery_secs as i64));
        } else if self.metrics.consecutive_failures >= 2 {
            self.status = ProviderStatus::Failing;
        } else {
            self.status = ProviderStatus::Degraded;
        }
    }

    pub fn is_circuit_open(&self, now: DateTime<Utc>) -> bool {
        self.circuit_open_until.map(|until| now < until).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health() -> ProviderHealth {
        ProviderHealth::new(1, 3)
    }

    #[test]
    fn test_ema_latency() {
        let mut m = ProviderMetrics::default();
        m.record_success(100.0);
        assert_eq!(m.average_latency_ms, 100.0);
        m.record_success(200.0);
        // 0.9 * 100 + 0.1 * 200
        assert!((m.average_latency_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let now = Utc::now();
        let mut h = health();

        h.on_failure(now, 300);
        h.on_failure(now, 300);
        assert_eq!(h.status, ProviderStatus::Failing);
        assert!(h.is_available(now));

        h.on_failure(now, 300);
        assert_eq!(h.status, ProviderStatus::CircuitOpen);
        assert!(!h.is_available(now));
        assert!(h.circuit_open_until.unwrap() > now);
    }

    #[test]
    fn test_circuit_recovers_after_window() {
        let now = Utc::now();
        let mut h = health();
        for _ in 0..3 {
            h.on_failure(now, 300);
        }
        assert!(!h.is_available(now));
        assert!(!h.is_available(now + Duration::seconds(299)));

        // At the window end the provider becomes selectable again.
        assert!(h.is_available(now + Duration::seconds(301)));
        assert_eq!(h.status, ProviderStatus::Degraded);
    }

    #[test]
    fn test_priority_score_ordering() {
        let healthy = health();

        let mut degraded = health();
        degraded.on_success(6000.0, 5000, 2000);
        assert_eq!(degraded.status, ProviderStatus::Degraded);

        let mut failing = health();
        failing.on_failure(Utc::now(), 300);
        failing.on_failure(Utc::now(), 300);

        assert!(healthy.priority_score() < degraded.priority_score());
        assert!(degraded.priority_score() < failing.priority_score());
    }

    #[test]
    fn test_latency_promotion_and_demotion() {
        let mut h = health();
        h.on_success(6000.0, 5000, 2000);
        assert_eq!(h.status, ProviderStatus::Degraded);

        // Mid-band latency keeps current status
        h.on_success(3000.0, 5000, 2000);
        assert_eq!(h.status, ProviderStatus::Degraded);

        h.on_success(500.0, 5000, 2000);
        assert_eq!(h.status, ProviderStatus::Healthy);
    }
}
