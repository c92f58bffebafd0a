//! Backend connection pools
//!
//! A [`BackendPool`] owns the real connections for one target. Callers lease a
//! connection with [`BackendPool::acquire`] and give it back by dropping the
//! [`BackendLease`] (or throw it away with [`BackendLease::discard`]).
//!
//! Implementations are created through the [`PoolProviderRegistry`], so the
//! pooling strategy is chosen by configuration rather than compiled in.

mod admission;
mod deadpool_connection;
mod direct;
mod lease;
mod prewarming;
mod provider;
mod registry;

pub use deadpool_connection::{BackendManager, PooledConnection};
pub use direct::DirectBackendPool;
pub use lease::BackendLease;
pub use prewarming::top_up_idle;
pub use provider::{Builder, DeadpoolBackendPool};
pub use registry::{DeadpoolProvider, DirectProvider, PoolProvider, PoolProviderRegistry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ProxyError;

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Current configured maximum
    pub max_size: usize,
    /// Connections that exist (idle + checked out)
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Callers blocked in `acquire`
    pub waiting: usize,
}

/// Sizing and lifetime settings for one pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_idle: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// How often idle connections are expired and topped up
    pub maintenance_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 20,
            min_idle: 5,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

/// Bounded pool of connections to a single backend target
#[async_trait]
pub trait BackendPool: Send + Sync + fmt::Debug {
    /// Target name used in logs and errors
    fn name(&self) -> &str;

    /// Lease a connection, failing with `PoolExhaustedTimeout` once `timeout` elapses
    async fn acquire(&self, timeout: Duration) -> Result<BackendLease, ProxyError>;

    /// Change capacity without closing checked-out connections
    ///
    /// Excess idle connections close immediately; excess leased connections
    /// close when they come back.
    fn resize(&self, max_size: usize, min_idle: usize);

    fn status(&self) -> PoolStatus;

    /// Close the pool; waiting and future acquisitions fail with `PoolClosed`
    async fn shutdown(&self);
}
