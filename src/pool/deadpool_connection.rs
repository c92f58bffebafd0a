use deadpool::managed;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::backend::{BackendConnection, BackendDriver, BackendTarget};
use crate::error::DriverError;

/// A driver connection plus the bookkeeping the pool needs to expire it
#[derive(Debug)]
pub struct PooledConnection {
    pub conn: Box<dyn BackendConnection>,
    pub created_at: Instant,
    /// Last time this connection went back to the pool
    pub idle_since: Instant,
}

impl PooledConnection {
    fn new(conn: Box<dyn BackendConnection>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            idle_since: now,
        }
    }

    /// Past max lifetime, or idle longer than the idle timeout
    #[must_use]
    pub fn is_expired(&self, idle_timeout: Duration, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() >= max_lifetime || self.idle_since.elapsed() >= idle_timeout
    }
}

/// Backend connection manager for deadpool
#[derive(Debug)]
pub struct BackendManager {
    driver: Arc<dyn BackendDriver>,
    target: BackendTarget,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl BackendManager {
    pub fn new(
        driver: Arc<dyn BackendDriver>,
        target: BackendTarget,
        idle_timeout: Duration,
        max_lifetime: Duration,
    ) -> Self {
        Self {
            driver,
            target,
            idle_timeout,
            max_lifetime,
        }
    }

    #[must_use]
    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }
}

impl managed::Manager for BackendManager {
    type Type = PooledConnection;
    type Error = DriverError;

    async fn create(&self) -> Result<PooledConnection, DriverError> {
        debug!(target_name = %self.target.name, "Opening backend connection");
        let conn = self.driver.connect(&self.target).await?;
        debug!(
            target_name = %self.target.name,
            handle = %conn.handle(),
            "Backend connection opened"
        );
        Ok(PooledConnection::new(conn))
    }

    async fn recycle(
        &self,
        conn: &mut PooledConnection,
        _: &managed::Metrics,
    ) -> managed::RecycleResult<DriverError> {
        if conn.is_expired(self.idle_timeout, self.max_lifetime) {
            debug!(
                target_name = %self.target.name,
                handle = %conn.conn.handle(),
                "Backend connection expired"
            );
            return Err(managed::RecycleError::Backend(DriverError::Broken(
                "connection expired".into(),
            )));
        }
        if !conn.conn.is_valid().await {
            debug!(
                target_name = %self.target.name,
                handle = %conn.conn.handle(),
                "Backend connection failed validation"
            );
            return Err(managed::RecycleError::Backend(DriverError::Broken(
                "validation failed".into(),
            )));
        }
        Ok(())
    }

    fn detach(&self, conn: &mut PooledConnection) {
        debug!(
            target_name = %self.target.name,
            handle = %conn.conn.handle(),
            "Backend connection detached from pool"
        );
    }
}

pub(crate) type Pool = managed::Pool<BackendManager>;
