//! Backend session reuse across XA branches
//!
//! A backend session leaves the XA pool the first time an XA session needs
//! it and stays bound through any number of branches. It goes back only when
//! the latest branch has completed *and* the client closed its XA connection;
//! whichever of the two happens last triggers the release.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::pool::BackendLease;
use crate::types::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum XaLifecycleState {
    InPool,
    ActiveTxIncomplete,
    ActiveTxComplete,
}

impl fmt::Display for XaLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InPool => "IN_POOL",
            Self::ActiveTxIncomplete => "ACTIVE_TX_INCOMPLETE",
            Self::ActiveTxComplete => "ACTIVE_TX_COMPLETE",
        })
    }
}

/// The backend session bound to one XA-enabled client session
#[derive(Debug)]
pub struct XaBackendSession {
    lease: Option<BackendLease>,
    state: XaLifecycleState,
    /// A branch has started since the backend session was attached
    branch_seen: bool,
    wrapper_closed: bool,
    branches_served: u64,
    transaction_timeout: Duration,
}

impl Default for XaBackendSession {
    fn default() -> Self {
        Self::new()
    }
}

impl XaBackendSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lease: None,
            state: XaLifecycleState::InPool,
            branch_seen: false,
            wrapper_closed: false,
            branches_served: 0,
            transaction_timeout: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn state(&self) -> XaLifecycleState {
        self.state
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.lease.is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.wrapper_closed
    }

    /// Handle of the bound backend connection, if any
    #[must_use]
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.lease.as_ref().map(BackendLease::handle)
    }

    #[must_use]
    pub fn branches_served(&self) -> u64 {
        self.branches_served
    }

    pub fn lease_mut(&mut self) -> Option<&mut BackendLease> {
        self.lease.as_mut()
    }

    /// Bind a backend session taken from the XA pool (IN_POOL -> ACTIVE_TX_INCOMPLETE)
    pub fn attach(&mut self, lease: BackendLease) {
        debug!(handle = %lease.handle(), "Attached XA backend session");
        self.lease = Some(lease);
        self.state = XaLifecycleState::ActiveTxIncomplete;
        self.branch_seen = false;
    }

    /// A new branch started on this session
    ///
    /// From ACTIVE_TX_COMPLETE this is the reuse path: the same backend session
    /// serves the next branch.
    pub fn branch_started(&mut self) {
        if self.state == XaLifecycleState::ActiveTxComplete {
            debug!(handle = ?self.handle(), "Reusing XA backend session for next branch");
        }
        self.state = XaLifecycleState::ActiveTxIncomplete;
        self.branch_seen = true;
        self.branches_served += 1;
    }

    /// The current branch reached prepare, commit or rollback
    pub fn branch_completed(&mut self) {
        if self.state == XaLifecycleState::ActiveTxIncomplete {
            self.state = XaLifecycleState::ActiveTxComplete;
        }
    }

    /// Whether the current branch is still open
    #[must_use]
    pub fn has_incomplete_branch(&self) -> bool {
        self.state == XaLifecycleState::ActiveTxIncomplete && self.branch_seen
    }

    /// The client closed its XA connection wrapper; idempotent
    pub fn close_wrapper(&mut self) {
        self.wrapper_closed = true;
    }

    /// Hand the backend session back once both release conditions hold
    pub fn take_releasable(&mut self) -> Option<BackendLease> {
        if !self.wrapper_closed || self.has_incomplete_branch() {
            return None;
        }
        let lease = self.lease.take()?;
        debug!(
            handle = %lease.handle(),
            branches = self.branches_served,
            "Returning XA backend session to pool"
        );
        self.state = XaLifecycleState::InPool;
        Some(lease)
    }

    /// Detach unconditionally, e.g. when the session is reaped
    pub fn detach(&mut self) -> Option<BackendLease> {
        self.state = XaLifecycleState::InPool;
        self.lease.take()
    }

    #[must_use]
    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    pub fn set_transaction_timeout(&mut self, timeout: Duration) {
        self.transaction_timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendTarget, MemoryDriver};
    use crate::pool::{BackendPool, DirectBackendPool};
    use std::sync::Arc;

    async fn lease() -> (DirectBackendPool, BackendLease) {
        let pool = DirectBackendPool::new(
            Arc::new(MemoryDriver::new("memory")),
            BackendTarget::new("xa", "mem://xa"),
            2,
        );
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        (pool, lease)
    }

    #[tokio::test]
    async fn test_release_needs_both_conditions() {
        let (_pool, lease) = lease().await;
        let mut session = XaBackendSession::new();
        session.attach(lease);
        session.branch_started();

        session.close_wrapper();
        assert!(session.take_releasable().is_none());
        assert_eq!(session.state(), XaLifecycleState::ActiveTxIncomplete);

        session.branch_completed();
        assert!(session.take_releasable().is_some());
        assert_eq!(session.state(), XaLifecycleState::InPool);
    }

    #[tokio::test]
    async fn test_completed_branch_alone_keeps_binding() {
        let (_pool, lease) = lease().await;
        let mut session = XaBackendSession::new();
        session.attach(lease);
        session.branch_started();
        session.branch_completed();
        assert!(session.take_releasable().is_none());
        assert_eq!(session.state(), XaLifecycleState::ActiveTxComplete);
    }

    #[tokio::test]
    async fn test_next_branch_reuses_backend_session() {
        let (_pool, lease) = lease().await;
        let handle = lease.handle();
        let mut session = XaBackendSession::new();
        session.attach(lease);
        session.branch_started();
        session.branch_completed();

        session.branch_started();
        assert_eq!(session.state(), XaLifecycleState::ActiveTxIncomplete);
        assert_eq!(session.handle(), Some(handle));
        assert_eq!(session.branches_served(), 2);
    }

    #[tokio::test]
    async fn test_close_without_branch_releases() {
        let (_pool, lease) = lease().await;
        let mut session = XaBackendSession::new();
        session.attach(lease);
        session.close_wrapper();
        session.close_wrapper();
        assert!(session.take_releasable().is_some());
    }
}
