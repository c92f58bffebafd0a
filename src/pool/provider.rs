//! Deadpool-backed backend pool
//!
//! `DeadpoolBackendPool` keeps idle connections for reuse. Its maintenance task
//! periodically evicts expired idle connections and tops the pool up to its
//! minimum idle count. Every acquisition is bounded by `tokio::time::timeout`
//! at this layer, whatever deadpool's own timeouts are.
//!
//! Checkouts pass the admission gate before reaching deadpool. Deadpool only
//! drops permits for connections that exist when it shrinks, so the gate is
//! what holds outstanding leases to the current maximum.

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool::managed;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::admission::{Admission, AdmissionError};
use super::deadpool_connection::{BackendManager, Pool};
use super::prewarming::top_up_idle;
use super::{BackendLease, BackendPool, PoolSettings, PoolStatus};
use crate::backend::{BackendDriver, BackendTarget};
use crate::error::{ProxyError, millis};

/// Pool of reusable backend connections built on `deadpool::managed`
#[derive(Debug)]
pub struct DeadpoolBackendPool {
    pool: Pool,
    admission: Admission,
    name: Arc<str>,
    min_idle: Arc<AtomicUsize>,
    closed: AtomicBool,
    /// Stops the maintenance task
    shutdown_tx: broadcast::Sender<()>,
}

/// Builder for constructing `DeadpoolBackendPool` instances
///
/// ```no_run
/// # async fn demo() -> anyhow::Result<()> {
/// use std::sync::Arc;
/// use ojp_proxy::backend::{BackendTarget, MemoryDriver};
/// use ojp_proxy::pool::DeadpoolBackendPool;
///
/// let target = BackendTarget {
///     name: "orders".into(),
///     url: "memory://orders".into(),
///     username: None,
///     password: None,
/// };
/// let pool = DeadpoolBackendPool::builder(Arc::new(MemoryDriver::new("memory")), target)
///     .max_size(10)
///     .min_idle(2)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct Builder {
    driver: Arc<dyn BackendDriver>,
    target: BackendTarget,
    settings: PoolSettings,
}

impl Builder {
    #[must_use]
    pub fn new(driver: Arc<dyn BackendDriver>, target: BackendTarget) -> Self {
        Self {
            driver,
            target,
            settings: PoolSettings::default(),
        }
    }

    /// Replace all settings at once
    #[must_use]
    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.settings.max_size = max_size;
        self
    }

    #[must_use]
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.settings.min_idle = min_idle;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.settings.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.settings.max_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.settings.maintenance_interval = interval;
        self
    }

    /// Build the pool and start its maintenance task
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if deadpool rejects the configuration
    pub fn build(self) -> Result<DeadpoolBackendPool> {
        let name: Arc<str> = Arc::from(self.target.name.as_str());
        let manager = BackendManager::new(
            self.driver,
            self.target,
            self.settings.idle_timeout,
            self.settings.max_lifetime,
        );
        let pool = Pool::builder(manager)
            .max_size(self.settings.max_size)
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .with_context(|| format!("Failed to create backend pool '{name}'"))?;

        let min_idle = Arc::new(AtomicUsize::new(self.settings.min_idle));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        if !self.settings.maintenance_interval.is_zero() {
            tokio::spawn(run_maintenance(
                pool.clone(),
                name.clone(),
                min_idle.clone(),
                self.settings.maintenance_interval,
                shutdown_rx,
            ));
        }

        info!(
            target_name = %name,
            max_size = self.settings.max_size,
            min_idle = self.settings.min_idle,
            "Created backend pool"
        );

        Ok(DeadpoolBackendPool {
            pool,
            admission: Admission::new(self.settings.max_size),
            name,
            min_idle,
            closed: AtomicBool::new(false),
            shutdown_tx,
        })
    }
}

impl DeadpoolBackendPool {
    #[must_use]
    pub fn builder(driver: Arc<dyn BackendDriver>, target: BackendTarget) -> Builder {
        Builder::new(driver, target)
    }

    #[must_use]
    pub fn min_idle(&self) -> usize {
        self.min_idle.load(Ordering::SeqCst)
    }

    fn exhausted(&self, started: Instant) -> ProxyError {
        ProxyError::PoolExhaustedTimeout {
            target: self.name.to_string(),
            elapsed_ms: millis(started.elapsed()),
            max_size: self.admission.max_size(),
        }
    }

    /// Evict expired idle connections and top up to min idle right now
    pub async fn run_maintenance_cycle(&self) -> (usize, usize) {
        maintenance_cycle(&self.pool, &self.name, self.min_idle()).await
    }
}

#[async_trait]
impl BackendPool for DeadpoolBackendPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, timeout: Duration) -> Result<BackendLease, ProxyError> {
        let started = Instant::now();
        let permit = match self.admission.admit(timeout).await {
            Ok(permit) => permit,
            Err(AdmissionError::Closed) => return Err(ProxyError::PoolClosed(self.name.to_string())),
            Err(AdmissionError::TimedOut) => return Err(self.exhausted(started)),
        };
        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, self.pool.get()).await {
            Ok(Ok(obj)) => Ok(BackendLease::pooled(obj, permit, self.name.clone())),
            Ok(Err(managed::PoolError::Backend(e))) => Err(ProxyError::TransientBackend {
                target: self.name.to_string(),
                attempts: 1,
                elapsed_ms: millis(started.elapsed()),
                reason: e.to_string(),
            }),
            Ok(Err(managed::PoolError::Closed)) => Err(ProxyError::PoolClosed(self.name.to_string())),
            Ok(Err(e)) => Err(ProxyError::TransientBackend {
                target: self.name.to_string(),
                attempts: 1,
                elapsed_ms: millis(started.elapsed()),
                reason: e.to_string(),
            }),
            Err(_) => Err(self.exhausted(started)),
        }
    }

    fn resize(&self, max_size: usize, min_idle: usize) {
        let before = self.admission.resize(max_size);
        self.pool.resize(max_size);
        self.min_idle.store(min_idle.min(max_size), Ordering::SeqCst);
        if before != max_size {
            info!(
                target_name = %self.name,
                from = before,
                to = max_size,
                min_idle,
                "Resized backend pool"
            );
        }
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: self.admission.max_size(),
            size: status.size,
            idle: status.available,
            in_use: self.admission.in_use(),
            waiting: self.admission.waiting() + status.waiting,
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let status = self.pool.status();
        info!(
            target_name = %self.name,
            idle = status.available,
            in_use = status.size.saturating_sub(status.available),
            "Shutting down backend pool"
        );
        self.admission.close();
        self.pool.close();
    }
}

/// One maintenance pass; returns (evicted, created)
async fn maintenance_cycle(pool: &Pool, name: &str, min_idle: usize) -> (usize, usize) {
    let evicted = Cell::new(0usize);
    let (idle_timeout, max_lifetime) = {
        let manager = pool.manager();
        (manager.idle_timeout(), manager.max_lifetime())
    };
    let _ = pool.retain(|conn, _| {
        let keep = !conn.is_expired(idle_timeout, max_lifetime);
        if !keep {
            evicted.set(evicted.get() + 1);
        }
        keep
    });
    let evicted = evicted.get();
    if evicted > 0 {
        debug!(target_name = %name, evicted, "Evicted expired idle connections");
    }

    let created = top_up_idle(pool, name, min_idle).await;
    (evicted, created)
}

async fn run_maintenance(
    pool: Pool,
    name: Arc<str>,
    min_idle: Arc<AtomicUsize>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!(target_name = %name, interval_secs = interval.as_secs(), "Starting pool maintenance");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.recv() => {
                debug!(target_name = %name, "Shutting down pool maintenance task");
                break;
            }
        }

        if pool.is_closed() {
            break;
        }
        let (evicted, created) =
            maintenance_cycle(&pool, &name, min_idle.load(Ordering::SeqCst)).await;
        if created > 0 || evicted > 0 {
            debug!(target_name = %name, evicted, created, "Pool maintenance cycle complete");
        }
    }

    if !pool.is_closed() {
        warn!(target_name = %name, "Pool maintenance stopped while pool still open");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryDriver;

    fn target() -> BackendTarget {
        BackendTarget {
            name: "orders".into(),
            url: "memory://orders".into(),
            username: None,
            password: None,
        }
    }

    fn build(driver: &MemoryDriver, max: usize) -> DeadpoolBackendPool {
        DeadpoolBackendPool::builder(Arc::new(driver.clone()), target())
            .max_size(max)
            .min_idle(0)
            .maintenance_interval(Duration::ZERO)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let builder = Builder::new(Arc::new(MemoryDriver::new("memory")), target());
        assert_eq!(builder.settings, PoolSettings::default());
    }

    #[test]
    fn test_builder_chaining_uses_last_value() {
        let builder = Builder::new(Arc::new(MemoryDriver::new("memory")), target())
            .max_size(10)
            .max_size(20)
            .min_idle(3)
            .idle_timeout(Duration::from_secs(5));
        assert_eq!(builder.settings.max_size, 20);
        assert_eq!(builder.settings.min_idle, 3);
        assert_eq!(builder.settings.idle_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 2);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let handle = lease.handle();
        drop(lease);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.handle(), handle);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_discarded_connection_is_not_reused() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 2);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let handle = lease.handle();
        lease.discard();
        assert_eq!(pool.status().size, 0);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(lease.handle(), handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_times_out_within_bound() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 1);
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let started = tokio::time::Instant::now();
        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_pool_timeout());
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_connect_failure_is_transient_backend() {
        let driver = MemoryDriver::new("memory");
        driver.set_available(false);
        let pool = build(&driver, 1);
        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transient_backend());
    }

    #[tokio::test]
    async fn test_resize_drops_excess_idle() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 3);
        let leases: Vec<_> = futures::future::join_all(
            (0..3).map(|_| pool.acquire(Duration::from_secs(1))),
        )
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
        drop(leases);
        assert_eq!(pool.status().idle, 3);

        pool.resize(1, 0);
        let status = pool.status();
        assert_eq!(status.max_size, 1);
        assert!(status.size <= 1);
    }

    #[tokio::test]
    async fn test_resize_lets_checked_out_drain() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 2);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.resize(1, 0);
        // Nothing forcibly closed
        assert_eq!(driver.live_connections(), 2);
        drop(a);
        drop(b);
        assert!(pool.status().size <= 1);
    }

    #[tokio::test]
    async fn test_shrink_of_empty_pool_bounds_checkouts() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 15);
        pool.resize(10, 0);

        let mut held = Vec::new();
        while let Ok(lease) = pool.acquire(Duration::from_millis(50)).await {
            held.push(lease);
        }
        assert_eq!(held.len(), 10);
        let status = pool.status();
        assert_eq!(status.in_use, 10);
        assert_eq!(driver.live_connections(), 10);
    }

    #[tokio::test]
    async fn test_shrink_below_checkouts_waits_for_returns() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 3);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.resize(1, 0);
        drop(a);
        assert!(pool.acquire(Duration::from_millis(50)).await.unwrap_err().is_pool_timeout());
        drop(b);
        let _c = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(pool.status().size <= 1);
    }

    #[tokio::test]
    async fn test_maintenance_tops_up_min_idle() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 5);
        pool.resize(5, 3);
        let (_, created) = pool.run_maintenance_cycle().await;
        assert_eq!(created, 3);
        assert_eq!(pool.status().idle, 3);
    }

    #[tokio::test]
    async fn test_maintenance_evicts_expired() {
        let driver = MemoryDriver::new("memory");
        let pool = DeadpoolBackendPool::builder(Arc::new(driver.clone()), target())
            .max_size(2)
            .min_idle(0)
            .idle_timeout(Duration::ZERO)
            .maintenance_interval(Duration::ZERO)
            .build()
            .unwrap();
        drop(pool.acquire(Duration::from_secs(1)).await.unwrap());
        let (evicted, _) = pool.run_maintenance_cycle().await;
        assert_eq!(evicted, 1);
        assert_eq!(driver.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes() {
        let driver = MemoryDriver::new("memory");
        let pool = build(&driver, 1);
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire(Duration::from_millis(50)).await,
            Err(ProxyError::PoolClosed(_))
        ));
    }
}
