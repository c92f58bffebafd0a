use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit state for one backend target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// All traffic allowed
    Closed,
    /// Every acquisition fails fast
    Open,
    /// One probe acquisition allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Outcome of asking the breaker for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Allowed { probe: bool },
    Rejected { failures: u32, retry_in: Duration },
}

/// Mutable breaker state, always updated under the breaker's lock
#[derive(Debug, Clone)]
pub struct BreakerHealth {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// A half-open probe has been admitted and not yet settled
    pub probe_in_flight: bool,
    pub total_failures: u64,
    pub total_rejections: u64,
}

impl Default for BreakerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerHealth {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    /// Decide whether one acquisition may proceed
    pub(crate) fn admit(&mut self, cool_down: Duration) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed { probe: false },
            CircuitState::Open => {
                let elapsed = self.opened_at.map_or(cool_down, |at| at.elapsed());
                if elapsed >= cool_down {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Allowed { probe: true }
                } else {
                    self.total_rejections += 1;
                    Admission::Rejected {
                        failures: self.consecutive_failures,
                        retry_in: cool_down - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen if !self.probe_in_flight => {
                self.probe_in_flight = true;
                Admission::Allowed { probe: true }
            }
            CircuitState::HalfOpen => {
                self.total_rejections += 1;
                Admission::Rejected {
                    failures: self.consecutive_failures,
                    retry_in: Duration::ZERO,
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    pub fn record_failure(&mut self, threshold: u32, probe: bool) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        if probe || self.consecutive_failures >= threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
        if probe {
            self.probe_in_flight = false;
        }
    }

    /// A probe ended without a verdict (pool timeout, cancellation)
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_closed() {
        let mut health = BreakerHealth::new();
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(
            health.admit(Duration::from_secs(60)),
            Admission::Allowed { probe: false }
        );
    }

    #[test]
    fn test_failures_below_threshold_stay_closed() {
        let mut health = BreakerHealth::new();
        health.record_failure(3, false);
        health.record_failure(3, false);
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 2);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut health = BreakerHealth::new();
        health.record_failure(3, false);
        health.record_failure(3, false);
        health.record_success();
        health.record_failure(3, false);
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 1);
    }

    #[test]
    fn test_threshold_opens() {
        let mut health = BreakerHealth::new();
        for _ in 0..3 {
            health.record_failure(3, false);
        }
        assert_eq!(health.state, CircuitState::Open);
        assert!(matches!(
            health.admit(Duration::from_secs(60)),
            Admission::Rejected { failures: 3, .. }
        ));
        assert_eq!(health.total_rejections, 1);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
    }
}
