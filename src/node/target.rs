//! Everything a node keeps per backend target
//!
//! One [`TargetRuntime`] exists per connection hash. It owns the target's
//! pool, the optional XA pool, the circuit breaker, the fast/slow segregator,
//! the XA branch registry and the capacity coordinator.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{BackendDriver, BackendTarget};
use crate::capacity::{CapacityShare, CapacityTotals, ClusterHealth, PoolCapacityCoordinator};
use crate::error::ProxyError;
use crate::health::CircuitBreaker;
use crate::metrics::MetricsCollector;
use crate::pool::{BackendLease, BackendPool, PoolProviderRegistry, PoolSettings, PoolStatus};
use crate::segregation::{OperationSignature, SegregatedLease, SegregationSettings, Segregator};
use crate::types::ConnHash;
use crate::xa::XaRegistry;

/// Cluster-wide sizes for a target's XA pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XaPoolSettings {
    pub max_size: usize,
    pub min_idle: usize,
}

/// Resolved settings for one target
///
/// `pool.max_size` and `pool.min_idle` (and the XA sizes) are cluster totals;
/// the node applies its share of them.
#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub provider: Option<String>,
    pub pool: PoolSettings,
    pub segregation: SegregationSettings,
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub xa: Option<XaPoolSettings>,
    pub view_ttl: Duration,
}

impl TargetSettings {
    #[must_use]
    pub fn totals(&self) -> CapacityTotals {
        let xa = self.xa.unwrap_or(XaPoolSettings {
            max_size: 0,
            min_idle: 0,
        });
        CapacityTotals {
            max_size: self.pool.max_size,
            min_idle: self.pool.min_idle,
            xa_max_size: xa.max_size,
            xa_min_idle: xa.min_idle,
        }
    }
}

/// Live state for one backend target on this node
#[derive(Debug)]
pub struct TargetRuntime {
    conn_hash: ConnHash,
    name: String,
    pool: Arc<dyn BackendPool>,
    xa_pool: Option<Arc<dyn BackendPool>>,
    breaker: CircuitBreaker,
    segregator: Arc<Segregator>,
    xa_registry: XaRegistry,
    coordinator: PoolCapacityCoordinator,
    acquire_timeout: Duration,
    metrics: MetricsCollector,
}

impl TargetRuntime {
    /// Build pools sized to this node's share under `health`
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot build a pool.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        conn_hash: ConnHash,
        target: BackendTarget,
        driver: Arc<dyn BackendDriver>,
        providers: &PoolProviderRegistry,
        settings: &TargetSettings,
        health: &ClusterHealth,
        self_address: &str,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let totals = settings.totals();
        let share = CapacityShare::compute(&totals, health, self_address);
        let provider = providers.resolve(settings.provider.as_deref())?;
        let name = target.name.clone();

        let pool_settings = PoolSettings {
            max_size: share.max_size,
            min_idle: share.min_idle,
            ..settings.pool.clone()
        };
        let pool = provider
            .create(driver.clone(), target.clone(), &pool_settings)
            .with_context(|| format!("Failed to build pool for '{name}'"))?;

        let xa_pool = match settings.xa {
            Some(_) => {
                let xa_settings = PoolSettings {
                    max_size: share.xa_max_size,
                    min_idle: share.xa_min_idle,
                    ..settings.pool.clone()
                };
                let xa_target = BackendTarget {
                    name: format!("{name}-xa"),
                    ..target
                };
                Some(
                    provider
                        .create(driver, xa_target, &xa_settings)
                        .with_context(|| format!("Failed to build XA pool for '{name}'"))?,
                )
            }
            None => None,
        };

        let segregator = Arc::new(
            Segregator::new(pool.clone(), &settings.segregation).with_metrics(metrics.clone()),
        );
        let mut coordinator = PoolCapacityCoordinator::new(
            name.clone(),
            self_address,
            totals,
            settings.view_ttl,
            pool.clone(),
            share,
        )
        .with_segregator(segregator.clone())
        .with_metrics(metrics.clone());
        if let Some(xa_pool) = &xa_pool {
            coordinator = coordinator.with_xa_pool(xa_pool.clone());
        }

        info!(
            target_name = %name,
            conn_hash = %conn_hash,
            provider = provider.name(),
            healthy_nodes = share.healthy_nodes,
            max_size = share.max_size,
            xa = xa_pool.is_some(),
            "Target ready"
        );

        Ok(Self {
            breaker: CircuitBreaker::new(
                name.clone(),
                settings.failure_threshold,
                settings.cool_down,
            )
            .with_metrics(metrics.clone()),
            xa_registry: XaRegistry::new(name.clone()).with_metrics(metrics.clone()),
            conn_hash,
            name,
            pool,
            xa_pool,
            segregator,
            coordinator,
            acquire_timeout: settings.pool.acquire_timeout,
            metrics,
        })
    }

    #[must_use]
    pub fn conn_hash(&self) -> &ConnHash {
        &self.conn_hash
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn segregator(&self) -> &Segregator {
        &self.segregator
    }

    #[must_use]
    pub fn xa_registry(&self) -> &XaRegistry {
        &self.xa_registry
    }

    #[must_use]
    pub fn coordinator(&self) -> &PoolCapacityCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn supports_xa(&self) -> bool {
        self.xa_pool.is_some()
    }

    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    #[must_use]
    pub fn xa_pool_status(&self) -> Option<PoolStatus> {
        self.xa_pool.as_ref().map(|p| p.status())
    }

    fn record(&self, result: &Result<impl Sized, ProxyError>) {
        match result {
            Ok(_) => self.metrics.record_acquisition(&self.name),
            Err(e) if e.is_pool_timeout() => self.metrics.record_acquisition_timeout(&self.name),
            Err(_) => {}
        }
    }

    /// Lease a connection for `signature` through the breaker and segregator
    ///
    /// # Errors
    ///
    /// `CircuitOpen`, `PoolExhaustedTimeout`, `TransientBackend` or `PoolClosed`.
    pub async fn acquire(&self, signature: &OperationSignature) -> Result<SegregatedLease, ProxyError> {
        let result = self
            .breaker
            .call(self.segregator.acquire(signature, self.acquire_timeout))
            .await;
        self.record(&result);
        if let Err(e) = &result {
            debug!(target_name = %self.name, error = %e, "Acquisition failed");
        }
        result
    }

    /// Lease a backend session from the XA pool
    ///
    /// # Errors
    ///
    /// `XAER_RMERR` when XA is not enabled for the target, otherwise as
    /// [`Self::acquire`].
    pub async fn acquire_xa(&self) -> Result<BackendLease, ProxyError> {
        let Some(xa_pool) = &self.xa_pool else {
            return Err(ProxyError::xa(
                crate::error::XaErrorCode::RmErr,
                format!("XA is not enabled for '{}'", self.name),
            ));
        };
        let result = self
            .breaker
            .call(xa_pool.acquire(self.acquire_timeout))
            .await;
        self.record(&result);
        result
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        if let Some(xa_pool) = &self.xa_pool {
            xa_pool.shutdown().await;
        }
    }
}
