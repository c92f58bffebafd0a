//! Per-node health and load as seen by one client

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::Endpoint;
use crate::types::NodeId;

#[derive(Debug)]
struct Health {
    healthy: bool,
    last_failure: Option<Instant>,
    probe_delay: Duration,
}

/// One configured node
#[derive(Debug)]
pub struct NodeState {
    id: NodeId,
    endpoint: Endpoint,
    address: String,
    sessions: AtomicUsize,
    health: Mutex<Health>,
}

impl NodeState {
    #[must_use]
    pub fn new(id: NodeId, endpoint: Endpoint, initial_probe_delay: Duration) -> Self {
        Self {
            id,
            address: endpoint.address(),
            endpoint,
            sessions: AtomicUsize::new(0),
            health: Mutex::new(Health {
                healthy: true,
                last_failure: None,
                probe_delay: initial_probe_delay,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    /// Sessions this client has open on the node
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    pub(super) fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn session_closed(&self) {
        let _ = self
            .sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a transport failure; returns true if the node was healthy
    pub(super) fn mark_unhealthy(&self) -> bool {
        let mut health = self.lock();
        let was_healthy = health.healthy;
        health.healthy = false;
        health.last_failure = Some(Instant::now());
        was_healthy
    }

    /// Successful probe: healthy again with the backoff reset
    pub(super) fn mark_healthy(&self, initial_probe_delay: Duration) {
        let mut health = self.lock();
        health.healthy = true;
        health.last_failure = None;
        health.probe_delay = initial_probe_delay;
    }

    /// Failed probe: wait twice as long next time
    pub(super) fn probe_failed(&self, max_delay: Duration) {
        let mut health = self.lock();
        health.last_failure = Some(Instant::now());
        health.probe_delay = health.probe_delay.saturating_mul(2).min(max_delay);
    }

    /// Whether an unhealthy node has waited out its probe delay
    #[must_use]
    pub fn probe_due(&self, now: Instant) -> bool {
        let health = self.lock();
        !health.healthy
            && health
                .last_failure
                .is_none_or(|failed| now.duration_since(failed) >= health.probe_delay)
    }

    #[must_use]
    pub fn probe_delay(&self) -> Duration {
        self.lock().probe_delay
    }

    /// `host:port(UP)` or `host:port(DOWN)`
    #[must_use]
    pub fn health_entry(&self) -> String {
        let status = if self.is_healthy() { "UP" } else { "DOWN" };
        format!("{}({status})", self.address)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
