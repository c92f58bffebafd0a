//! Lock-free metrics collector

use super::{MetricsSnapshot, TargetStats};
use crate::health::CircuitState;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Per-target counters (atomic, updated from hot paths)
#[derive(Debug, Default)]
struct TargetMetrics {
    acquisitions: AtomicU64,
    acquisition_timeouts: AtomicU64,
    backend_failures: AtomicU64,
    circuit_opened: AtomicU64,
    circuit_half_opened: AtomicU64,
    circuit_closed: AtomicU64,
    resizes: AtomicU64,
    slot_borrows: AtomicU64,
}

impl TargetMetrics {
    fn to_target_stats(&self, target: &str) -> TargetStats {
        TargetStats {
            target: target.to_string(),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            acquisition_timeouts: self.acquisition_timeouts.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            circuit_opened: self.circuit_opened.load(Ordering::Relaxed),
            circuit_half_opened: self.circuit_half_opened.load(Ordering::Relaxed),
            circuit_closed: self.circuit_closed.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
            slot_borrows: self.slot_borrows.load(Ordering::Relaxed),
            pool: None,
        }
    }
}

/// Thread-safe metrics collector
///
/// Cheap to clone; every clone updates the same counters.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_reaped: AtomicU64,
    active_sessions: AtomicUsize,
    statements: AtomicU64,
    xa_branches_started: AtomicU64,
    xa_heuristic_outcomes: AtomicU64,
    client_retries: AtomicU64,
    client_failovers: AtomicU64,
    targets: DashMap<String, TargetMetrics>,
    node_sessions: DashMap<String, usize>,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                sessions_opened: AtomicU64::new(0),
                sessions_closed: AtomicU64::new(0),
                sessions_reaped: AtomicU64::new(0),
                active_sessions: AtomicUsize::new(0),
                statements: AtomicU64::new(0),
                xa_branches_started: AtomicU64::new(0),
                xa_heuristic_outcomes: AtomicU64::new(0),
                client_retries: AtomicU64::new(0),
                client_failovers: AtomicU64::new(0),
                targets: DashMap::new(),
                node_sessions: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    #[inline]
    fn with_target<F>(&self, target: &str, action: F)
    where
        F: FnOnce(&TargetMetrics),
    {
        if let Some(metrics) = self.inner.targets.get(target) {
            action(metrics.value());
            return;
        }
        let metrics = self.inner.targets.entry(target.to_string()).or_default();
        action(metrics.value());
    }

    pub fn session_opened(&self) {
        self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.inner.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.active_sessions.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }

    /// Closed by the idle-leak reaper rather than by the client
    pub fn session_reaped(&self) {
        self.inner.sessions_reaped.fetch_add(1, Ordering::Relaxed);
        self.session_closed();
    }

    pub fn record_statement(&self) {
        self.inner.statements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition(&self, target: &str) {
        self.with_target(target, |t| {
            t.acquisitions.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_acquisition_timeout(&self, target: &str) {
        self.with_target(target, |t| {
            t.acquisition_timeouts.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_backend_failure(&self, target: &str) {
        self.with_target(target, |t| {
            t.backend_failures.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_circuit_transition(&self, target: &str, to: CircuitState) {
        self.with_target(target, |t| {
            let counter = match to {
                CircuitState::Open => &t.circuit_opened,
                CircuitState::HalfOpen => &t.circuit_half_opened,
                CircuitState::Closed => &t.circuit_closed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_pool_resize(&self, target: &str) {
        self.with_target(target, |t| {
            t.resizes.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_slot_borrow(&self, target: &str) {
        self.with_target(target, |t| {
            t.slot_borrows.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_xa_branch_started(&self) {
        self.inner.xa_branches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_xa_heuristic(&self) {
        self.inner
            .xa_heuristic_outcomes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_retry(&self) {
        self.inner.client_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_failover(&self) {
        self.inner.client_failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Sessions this client currently has bound to `node`
    pub fn set_node_sessions(&self, node: &str, sessions: usize) {
        self.inner.node_sessions.insert(node.to_string(), sessions);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut targets: Vec<TargetStats> = self
            .inner
            .targets
            .iter()
            .map(|entry| entry.value().to_target_stats(entry.key()))
            .collect();
        targets.sort_by(|a, b| a.target.cmp(&b.target));

        let mut node_sessions: Vec<(String, usize)> = self
            .inner
            .node_sessions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        node_sessions.sort();

        MetricsSnapshot {
            sessions_opened: self.inner.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.inner.sessions_closed.load(Ordering::Relaxed),
            sessions_reaped: self.inner.sessions_reaped.load(Ordering::Relaxed),
            active_sessions: self.inner.active_sessions.load(Ordering::Relaxed),
            statements: self.inner.statements.load(Ordering::Relaxed),
            xa_branches_started: self.inner.xa_branches_started.load(Ordering::Relaxed),
            xa_heuristic_outcomes: self.inner.xa_heuristic_outcomes.load(Ordering::Relaxed),
            client_retries: self.inner.client_retries.load(Ordering::Relaxed),
            client_failovers: self.inner.client_failovers.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
            targets,
            node_sessions,
        }
    }
}
