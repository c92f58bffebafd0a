//! Per-target circuit breaker
//!
//! CLOSED lets everything through. After `failure_threshold` consecutive
//! backend failures the breaker opens and every acquisition fails fast until
//! the cool-down elapses. Then exactly one probe is admitted (HALF_OPEN): its
//! success closes the breaker, its failure re-opens it with a fresh cool-down.
//!
//! Only `TransientBackend` errors count as failures. Pool timeouts, cancelled
//! acquisitions and statement errors leave the breaker untouched.

mod types;

pub use types::{BreakerHealth, CircuitState};

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ProxyError, millis};
use crate::metrics::MetricsCollector;
use types::Admission;

/// Health gate in front of one backend target's pool
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    failure_threshold: u32,
    cool_down: Duration,
    health: Mutex<BreakerHealth>,
    metrics: Option<MetricsCollector>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            target: target.into(),
            failure_threshold: failure_threshold.max(1),
            cool_down,
            health: Mutex::new(BreakerHealth::new()),
            metrics: None,
        }
    }

    /// Record state transitions in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Copy of the current breaker state
    #[must_use]
    pub fn health(&self) -> BreakerHealth {
        self.lock().clone()
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) {
        if from == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                target_name = %self.target,
                from = %from,
                cool_down_ms = millis(self.cool_down),
                "Circuit opened"
            ),
            _ => info!(target_name = %self.target, from = %from, to = %to, "Circuit state changed"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_transition(&self.target, to);
        }
    }

    /// Ask for admission of one acquisition attempt
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` when the breaker is open, or half-open with its
    /// single probe already in flight.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, ProxyError> {
        let (from, admission, to) = {
            let mut health = self.lock();
            let from = health.state;
            let admission = health.admit(self.cool_down);
            (from, admission, health.state)
        };
        self.transitioned(from, to);

        match admission {
            Admission::Allowed { probe } => Ok(BreakerPermit {
                breaker: self,
                probe,
                settled: false,
            }),
            Admission::Rejected { failures, retry_in } => Err(ProxyError::CircuitOpen {
                target: self.target.clone(),
                failures,
                retry_in_ms: millis(retry_in),
            }),
        }
    }

    fn on_success(&self) {
        let (from, to) = {
            let mut health = self.lock();
            let from = health.state;
            health.record_success();
            (from, health.state)
        };
        self.transitioned(from, to);
    }

    fn on_failure(&self, probe: bool) {
        let (from, to) = {
            let mut health = self.lock();
            let from = health.state;
            health.record_failure(self.failure_threshold, probe);
            (from, health.state)
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_failure(&self.target);
        }
        self.transitioned(from, to);
    }

    /// Run `attempt` under the breaker and feed its outcome back
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` without running `attempt` when rejected, otherwise
    /// whatever `attempt` returns.
    pub async fn call<T, F>(&self, attempt: F) -> Result<T, ProxyError>
    where
        F: Future<Output = Result<T, ProxyError>>,
    {
        let permit = self.try_acquire()?;
        let result = attempt.await;
        permit.settle(&result);
        result
    }
}

/// Admission ticket for one attempt; dropping it unsettled is neutral
#[derive(Debug)]
#[must_use = "settle the permit with the attempt's outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this attempt is the half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// Classify an acquisition outcome
    pub fn settle<T>(self, result: &Result<T, ProxyError>) {
        match result {
            Ok(_) => self.success(),
            Err(e) if e.is_transient_backend() => self.failure(),
            Err(_) => drop(self),
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.lock().release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> ProxyError {
        ProxyError::TransientBackend {
            target: "orders".into(),
            attempts: 1,
            elapsed_ms: 1,
            reason: "refused".into(),
        }
    }

    fn trip(breaker: &CircuitBreaker, times: u32) {
        for _ in 0..times {
            breaker.try_acquire().unwrap().failure();
        }
    }

    #[test]
    fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("orders", 3, Duration::from_secs(60));
        trip(&breaker, 3);
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.try_acquire().unwrap_err();
        assert!(matches!(err, ProxyError::CircuitOpen { failures: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new("orders", 3, Duration::from_secs(60));
        trip(&breaker, 3);
        tokio::time::advance(Duration::from_secs(61)).await;

        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        probe.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_restarts_cool_down() {
        let breaker = CircuitBreaker::new("orders", 3, Duration::from_secs(60));
        trip(&breaker, 3);
        tokio::time::advance(Duration::from_secs(60)).await;

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let err = breaker.try_acquire().unwrap_err();
        assert!(matches!(err, ProxyError::CircuitOpen { retry_in_ms, .. } if retry_in_ms > 29_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_probe_frees_slot() {
        let breaker = CircuitBreaker::new("orders", 1, Duration::from_secs(1));
        trip(&breaker, 1);
        tokio::time::advance(Duration::from_secs(2)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_probe());
    }

    #[tokio::test]
    async fn test_call_classifies_outcomes() {
        let breaker = CircuitBreaker::new("orders", 2, Duration::from_secs(60));

        let timeout: Result<(), _> = breaker
            .call(async {
                Err(ProxyError::PoolExhaustedTimeout {
                    target: "orders".into(),
                    elapsed_ms: 1000,
                    max_size: 5,
                })
            })
            .await;
        assert!(timeout.is_err());
        assert_eq!(breaker.consecutive_failures(), 0);

        let _ = breaker.call(async { Err::<(), _>(transient()) }).await;
        let _ = breaker.call(async { Err::<(), _>(transient()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let mut ran = false;
        let rejected = breaker
            .call(async {
                ran = true;
                Ok(())
            })
            .await;
        assert!(rejected.is_err());
        assert!(!ran);
    }

    #[test]
    fn test_transitions_are_recorded() {
        let metrics = MetricsCollector::new();
        let breaker =
            CircuitBreaker::new("orders", 1, Duration::from_secs(60)).with_metrics(metrics.clone());
        trip(&breaker, 1);
        let snap = metrics.snapshot();
        let stats = snap.target("orders").unwrap();
        assert_eq!(stats.circuit_opened, 1);
        assert_eq!(stats.backend_failures, 1);
    }
}
