//! Connection-per-lease pool
//!
//! Opens a fresh backend connection for every lease and closes it on release.
//! Capacity is the shared admission gate; shrinking below the number of
//! outstanding leases is paid back as leases are released.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::admission::{Admission, AdmissionError};
use super::{BackendLease, BackendPool, PoolStatus};
use crate::backend::{BackendDriver, BackendTarget};
use crate::error::{ProxyError, millis};

#[derive(Debug)]
pub struct DirectBackendPool {
    name: Arc<str>,
    driver: Arc<dyn BackendDriver>,
    target: BackendTarget,
    admission: Admission,
    closed: AtomicBool,
}

impl DirectBackendPool {
    pub fn new(driver: Arc<dyn BackendDriver>, target: BackendTarget, max_size: usize) -> Self {
        info!(
            target_name = %target.name,
            max_size,
            "Created direct backend pool"
        );
        Self {
            name: Arc::from(target.name.as_str()),
            driver,
            target,
            admission: Admission::new(max_size),
            closed: AtomicBool::new(false),
        }
    }

    fn exhausted(&self, started: Instant) -> ProxyError {
        ProxyError::PoolExhaustedTimeout {
            target: self.name.to_string(),
            elapsed_ms: millis(started.elapsed()),
            max_size: self.admission.max_size(),
        }
    }
}

#[async_trait]
impl BackendPool for DirectBackendPool {
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
        let conn = match tokio::time::timeout(remaining, self.driver.connect(&self.target)).await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(ProxyError::TransientBackend {
                    target: self.name.to_string(),
                    attempts: 1,
                    elapsed_ms: millis(started.elapsed()),
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(self.exhausted(started)),
        };

        Ok(BackendLease::direct(conn, permit, self.name.clone()))
    }

    fn resize(&self, max_size: usize, _min_idle: usize) {
        let current = self.admission.resize(max_size);
        debug!(target_name = %self.name, from = current, to = max_size, "Resized direct pool");
    }

    fn status(&self) -> PoolStatus {
        let in_use = self.admission.in_use();
        PoolStatus {
            max_size: self.admission.max_size(),
            size: in_use,
            idle: 0,
            in_use,
            waiting: self.admission.waiting(),
        }
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.admission.close();
            info!(target_name = %self.name, "Direct backend pool closed");
        }
    }
}
