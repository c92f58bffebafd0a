//! Per-session state and the connection retention rule

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{BackendConnection, BackendCursor, IsolationLevel};
use crate::error::{ProxyError, XaErrorCode};
use crate::node::TargetRuntime;
use crate::segregation::SegregatedLease;
use crate::types::{ClientId, ConnectionHandle, CursorId, SessionId};
use crate::xa::{XaBackendSession, XaLifecycleState};

/// Server-side state of one logical client connection
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) client: ClientId,
    pub(crate) target: Arc<TargetRuntime>,
    pub(crate) isolation: IsolationLevel,
    /// The client asked for a transaction (auto-commit off)
    pub(crate) tx_requested: bool,
    /// `begin` has been issued on the bound connection
    pub(crate) backend_tx_open: bool,
    pub(crate) bound: Option<SegregatedLease>,
    pub(crate) cursors: HashMap<CursorId, BackendCursor>,
    pub(crate) xa: Option<XaBackendSession>,
    pub(crate) created_at: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) closed: bool,
}

impl Session {
    pub(crate) fn new(target: Arc<TargetRuntime>, client: ClientId, xa: bool) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            client,
            target,
            isolation: IsolationLevel::default(),
            tx_requested: false,
            backend_tx_open: false,
            bound: None,
            cursors: HashMap::new(),
            xa: xa.then(XaBackendSession::new),
            created_at: now,
            last_activity: now,
            closed: false,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ProxyError> {
        if self.closed {
            Err(ProxyError::SessionClosed(self.id.to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn xa_mut(&mut self) -> Result<&mut XaBackendSession, ProxyError> {
        let id = self.id;
        self.xa
            .as_mut()
            .ok_or_else(|| ProxyError::xa(XaErrorCode::Proto, format!("session {id} is not XA-enabled")))
    }

    /// Connection currently serving this session, if any
    pub(crate) fn connection(&mut self) -> Option<&mut dyn BackendConnection> {
        match &mut self.xa {
            Some(xa) => xa.lease_mut().map(|lease| lease.connection()),
            None => self
                .bound
                .as_mut()
                .map(|bound| bound.lease.connection()),
        }
    }

    pub(crate) fn bound_handle(&self) -> Option<ConnectionHandle> {
        match &self.xa {
            Some(xa) => xa.handle(),
            None => self.bound.as_ref().map(|b| b.lease.handle()),
        }
    }

    /// Connection can go back to the pool: no transaction, no open cursor
    pub(crate) fn can_release(&self) -> bool {
        self.xa.is_none() && !self.tx_requested && self.cursors.is_empty()
    }

    /// Apply the retention rule after an operation
    pub(crate) fn release_if_idle(&mut self) -> bool {
        if !self.can_release() {
            return false;
        }
        match self.bound.take() {
            Some(bound) => {
                debug!(session = %self.id, handle = %bound.lease.handle(), "Released backend connection");
                true
            }
            None => false,
        }
    }

    /// Throw away a connection that can no longer be trusted
    pub(crate) fn discard_connection(&mut self) {
        self.cursors.clear();
        self.backend_tx_open = false;
        if let Some(bound) = self.bound.take() {
            bound.into_lease().discard();
        }
        if let Some(lease) = self.xa.as_mut().and_then(XaBackendSession::detach) {
            lease.discard();
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            client: self.client,
            target: self.target.name().to_string(),
            isolation: self.isolation,
            in_transaction: self.tx_requested,
            connection: self.bound_handle(),
            open_cursors: self.cursors.len(),
            xa_state: self.xa.as_ref().map(XaBackendSession::state),
            age_ms: crate::error::millis(self.created_at.elapsed()),
            closed: self.closed,
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub client: ClientId,
    pub target: String,
    pub isolation: IsolationLevel,
    pub in_transaction: bool,
    /// Bound backend connection
    pub connection: Option<ConnectionHandle>,
    pub open_cursors: usize,
    pub xa_state: Option<XaLifecycleState>,
    pub age_ms: u64,
    pub closed: bool,
}
