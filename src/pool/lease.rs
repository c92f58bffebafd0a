//! Checked-out backend connections
//!
//! Dropping a lease returns the connection to its pool. A connection that
//! failed with a broken-connection error must go through [`BackendLease::discard`]
//! instead so it is never handed to another session.

use deadpool::managed::Object;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::admission::AdmissionPermit;
use super::deadpool_connection::BackendManager;
use crate::backend::BackendConnection;
use crate::types::ConnectionHandle;

enum LeaseInner {
    Pooled(Object<BackendManager>),
    Direct(Box<dyn BackendConnection>),
}

/// A backend connection checked out of a [`super::BackendPool`]
pub struct BackendLease {
    inner: Option<LeaseInner>,
    /// Released after the connection has gone back
    admission: Option<AdmissionPermit>,
    handle: ConnectionHandle,
    target: Arc<str>,
}

impl BackendLease {
    pub(crate) fn pooled(
        obj: Object<BackendManager>,
        admission: AdmissionPermit,
        target: Arc<str>,
    ) -> Self {
        let handle = obj.conn.handle();
        Self {
            inner: Some(LeaseInner::Pooled(obj)),
            admission: Some(admission),
            handle,
            target,
        }
    }

    pub(crate) fn direct(
        conn: Box<dyn BackendConnection>,
        admission: AdmissionPermit,
        target: Arc<str>,
    ) -> Self {
        let handle = conn.handle();
        Self {
            inner: Some(LeaseInner::Direct(conn)),
            admission: Some(admission),
            handle,
            target,
        }
    }

    /// Identity of the physical connection behind this lease
    #[must_use]
    #[inline]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn connection(&mut self) -> &mut dyn BackendConnection {
        match self.inner.as_mut() {
            Some(LeaseInner::Pooled(obj)) => obj.conn.as_mut(),
            Some(LeaseInner::Direct(conn)) => conn.as_mut(),
            None => unreachable!("lease is only emptied while being consumed"),
        }
    }

    /// Close the connection instead of returning it to the pool
    pub fn discard(mut self) {
        debug!(target_name = %self.target, handle = %self.handle, "Discarding backend connection");
        match self.inner.take() {
            Some(LeaseInner::Pooled(obj)) => drop(Object::take(obj)),
            Some(LeaseInner::Direct(conn)) => drop(conn),
            None => {}
        }
        drop(self.admission.take());
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        match self.inner.take() {
            Some(LeaseInner::Pooled(mut obj)) => {
                obj.idle_since = Instant::now();
            }
            Some(LeaseInner::Direct(conn)) => drop(conn),
            None => {}
        }
        drop(self.admission.take());
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease")
            .field("target", &self.target)
            .field("handle", &self.handle)
            .finish()
    }
}
