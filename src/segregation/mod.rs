//! Fast/slow operation segregation
//!
//! Every acquisition goes through a [`SlotManager`] partitioned into fast and
//! slow slots before reaching the backend pool, so a handful of long-running
//! operations cannot hold every connection. Operations are classified by the
//! [`PerformanceMonitor`] from their observed execution times.

mod monitor;
mod slots;

pub use monitor::{OperationSignature, PerformanceMonitor};
pub use slots::{SlotKind, SlotManager, SlotPermit, SlotStatus, slow_slots_for};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ProxyError, millis};
use crate::metrics::MetricsCollector;
use crate::pool::{BackendLease, BackendPool};

/// Segregation settings for one target
#[derive(Debug, Clone, PartialEq)]
pub struct SegregationSettings {
    pub enabled: bool,
    pub slow_fraction: f64,
    pub slow_threshold: Option<Duration>,
    pub borrow_window: Duration,
    pub refresh_interval: Duration,
}

impl Default for SegregationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_fraction: 0.2,
            slow_threshold: None,
            borrow_window: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(300),
        }
    }
}

/// A backend connection plus the slot it occupies
#[derive(Debug)]
pub struct SegregatedLease {
    pub lease: BackendLease,
    permit: SlotPermit,
}

impl SegregatedLease {
    #[must_use]
    pub fn kind(&self) -> SlotKind {
        self.permit.kind()
    }

    #[must_use]
    pub fn is_borrowed(&self) -> bool {
        self.permit.is_borrowed()
    }

    /// Give up the slot but keep the connection
    #[must_use]
    pub fn into_lease(self) -> BackendLease {
        self.lease
    }
}

/// Classifies operations and admits them through the matching slot partition
#[derive(Debug)]
pub struct Segregator {
    pool: Arc<dyn BackendPool>,
    monitor: PerformanceMonitor,
    slots: Arc<SlotManager>,
    metrics: Option<MetricsCollector>,
}

impl Segregator {
    pub fn new(pool: Arc<dyn BackendPool>, settings: &SegregationSettings) -> Self {
        let total = pool.status().max_size;
        Self {
            monitor: PerformanceMonitor::new(settings.refresh_interval, settings.slow_threshold),
            slots: Arc::new(SlotManager::new(
                total,
                settings.slow_fraction,
                settings.borrow_window,
                settings.enabled,
            )),
            pool,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<dyn BackendPool> {
        &self.pool
    }

    #[must_use]
    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    #[must_use]
    pub fn classify(&self, signature: &OperationSignature) -> SlotKind {
        if self.monitor.is_slow(signature) {
            SlotKind::Slow
        } else {
            SlotKind::Fast
        }
    }

    /// Take a slot for `signature`, then a connection, within `timeout` overall
    ///
    /// # Errors
    ///
    /// `PoolExhaustedTimeout` when no slot frees up in time, otherwise whatever
    /// the pool returns.
    pub async fn acquire(
        &self,
        signature: &OperationSignature,
        timeout: Duration,
    ) -> Result<SegregatedLease, ProxyError> {
        let started = Instant::now();
        let kind = self.classify(signature);

        let Some(permit) = self.slots.acquire(kind, timeout).await else {
            debug!(
                target_name = self.pool.name(),
                kind = %kind,
                operation = %signature,
                "No slot available"
            );
            return Err(ProxyError::PoolExhaustedTimeout {
                target: self.pool.name().to_string(),
                elapsed_ms: millis(started.elapsed()),
                max_size: self.slots.status().total,
            });
        };
        if permit.is_borrowed()
            && let Some(metrics) = &self.metrics
        {
            metrics.record_slot_borrow(self.pool.name());
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        let lease = self.pool.acquire(remaining).await?;
        Ok(SegregatedLease { lease, permit })
    }

    /// Feed an execution time back into classification, successful or not
    pub fn record_execution(&self, signature: &OperationSignature, elapsed: Duration) {
        self.monitor.record(signature, elapsed);
    }

    /// Follow a pool resize
    pub fn resize(&self, total: usize) {
        self.slots.resize(total);
    }
}
