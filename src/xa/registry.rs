//! Branch registry for one target
//!
//! Tracks every XA branch a node has seen for a target, validates each
//! protocol call against the branch's state and drives the backend through the
//! calling session's bound connection. Prepared branches outlive their session
//! so any session on the node can finish them.
//!
//! A branch leaves the registry as soon as it commits or rolls back. The last
//! few outcomes are remembered so a repeated commit or rollback stays a no-op.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, warn};

use super::{EndFlag, StartFlag, TxContext, TxState, XaBackendSession, XaVote, Xid};
use crate::backend::BackendConnection;
use crate::error::{DriverError, ProxyError, XaErrorCode};
use crate::metrics::MetricsCollector;
use crate::types::SessionId;

fn driver_error(xid: &Xid, err: DriverError) -> ProxyError {
    match err {
        DriverError::Xa { code, message } => ProxyError::xa(code, message),
        other => ProxyError::xa(XaErrorCode::RmErr, format!("{xid}: {other}")),
    }
}

fn not_found(xid: &Xid) -> ProxyError {
    ProxyError::xa(XaErrorCode::Nota, format!("unknown branch {xid}"))
}

fn bound_connection(
    backend: &mut XaBackendSession,
) -> Result<&mut dyn BackendConnection, ProxyError> {
    backend
        .lease_mut()
        .map(|lease| lease.connection())
        .ok_or_else(|| ProxyError::xa(XaErrorCode::Proto, "no backend session attached"))
}

/// Finished outcomes kept for repeated commit/rollback calls
const FINISHED_HISTORY: usize = 256;

/// XA branches known to one target on this node
#[derive(Debug)]
pub struct XaRegistry {
    target: String,
    branches: DashMap<Xid, TxContext>,
    finished: Mutex<VecDeque<(Xid, TxState)>>,
    metrics: Option<MetricsCollector>,
}

impl XaRegistry {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            branches: DashMap::new(),
            finished: Mutex::new(VecDeque::with_capacity(FINISHED_HISTORY)),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// State of a live branch, or the outcome of a recently finished one
    #[must_use]
    pub fn state(&self, xid: &Xid) -> Option<TxState> {
        if let Some(ctx) = self.branches.get(xid) {
            return Some(ctx.state);
        }
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(finished, _)| finished == xid)
            .map(|(_, state)| *state)
    }

    /// Branches not yet committed or rolled back
    #[must_use]
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    fn current_state(&self, xid: &Xid) -> Result<TxState, ProxyError> {
        self.state(xid).ok_or_else(|| not_found(xid))
    }

    /// Apply `next` to a branch and report whether `session` owns it
    ///
    /// A branch reaching a terminal state is dropped from the live table.
    fn advance(&self, xid: &Xid, session: SessionId, next: TxState) -> Result<bool, ProxyError> {
        let owned = {
            let mut ctx = self.branches.get_mut(xid).ok_or_else(|| not_found(xid))?;
            ctx.transition(next)?;
            ctx.owner == session
        };
        if next.is_terminal() {
            self.branches.remove(xid);
            self.remember(xid, next);
        }
        Ok(owned)
    }

    fn remember(&self, xid: &Xid, state: TxState) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if finished.len() == FINISHED_HISTORY {
            finished.pop_front();
        }
        finished.push_back((xid.clone(), state));
    }

    /// `xa_start` with TMNOFLAGS, TMJOIN or TMRESUME
    ///
    /// # Errors
    ///
    /// `XAER_DUPID` for a new branch whose xid exists, `XAER_NOTA` when joining
    /// or resuming an unknown xid, `XAER_PROTO` for a branch in the wrong state.
    pub async fn start(
        &self,
        session: SessionId,
        backend: &mut XaBackendSession,
        xid: &Xid,
        flag: StartFlag,
    ) -> Result<(), ProxyError> {
        match flag {
            StartFlag::NoFlags => {
                if self.branches.contains_key(xid) {
                    return Err(ProxyError::xa(
                        XaErrorCode::DupId,
                        format!("branch {xid} already exists"),
                    ));
                }
                let conn = bound_connection(backend)?;
                conn.xa_start(xid, flag)
                    .await
                    .map_err(|e| driver_error(xid, e))?;

                let mut ctx = TxContext::new(xid.clone(), session);
                ctx.transition(TxState::Active)?;
                match self.branches.entry(xid.clone()) {
                    Entry::Occupied(_) => {
                        return Err(ProxyError::xa(
                            XaErrorCode::DupId,
                            format!("branch {xid} already exists"),
                        ));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(ctx);
                    }
                }
                backend.branch_started();
                if let Some(metrics) = &self.metrics {
                    metrics.record_xa_branch_started();
                }
                debug!(target_name = %self.target, session = %session, xid = %xid, "XA branch started");
            }
            StartFlag::Join | StartFlag::Resume => {
                let state = self.current_state(xid)?;
                if !matches!(state, TxState::Active | TxState::Ended) {
                    return Err(ProxyError::xa(
                        XaErrorCode::Proto,
                        format!("cannot {flag:?} branch {xid} in state {state}"),
                    ));
                }
                let conn = bound_connection(backend)?;
                conn.xa_start(xid, flag)
                    .await
                    .map_err(|e| driver_error(xid, e))?;

                let mut ctx = self.branches.get_mut(xid).ok_or_else(|| not_found(xid))?;
                if ctx.state == TxState::Ended {
                    ctx.transition(TxState::Active)?;
                }
                ctx.associations += 1;
                drop(ctx);
                if !backend.has_incomplete_branch() {
                    backend.branch_started();
                }
            }
        }
        Ok(())
    }

    /// `xa_end` with TMSUCCESS, TMFAIL or TMSUSPEND
    ///
    /// # Errors
    ///
    /// `XAER_NOTA` for an unknown xid, `XAER_PROTO` unless the branch is active.
    pub async fn end(
        &self,
        backend: &mut XaBackendSession,
        xid: &Xid,
        flag: EndFlag,
    ) -> Result<(), ProxyError> {
        let state = self.current_state(xid)?;
        if state != TxState::Active {
            return Err(ProxyError::xa(
                XaErrorCode::Proto,
                format!("cannot end branch {xid} in state {state}"),
            ));
        }
        let conn = bound_connection(backend)?;
        conn.xa_end(xid, flag)
            .await
            .map_err(|e| driver_error(xid, e))?;

        let mut ctx = self.branches.get_mut(xid).ok_or_else(|| not_found(xid))?;
        ctx.transition(TxState::Ended)?;
        if flag == EndFlag::Fail {
            ctx.rollback_only = true;
        }
        Ok(())
    }

    /// First phase of two-phase commit
    ///
    /// A read-only vote completes the branch as committed. A resource manager
    /// failure leaves the branch INDETERMINATE for manual reconciliation.
    ///
    /// # Errors
    ///
    /// `XAER_NOTA`/`XAER_PROTO` for protocol violations, `HeuristicXaOutcome`
    /// when the resource manager fails.
    pub async fn prepare(
        &self,
        session: SessionId,
        backend: &mut XaBackendSession,
        xid: &Xid,
    ) -> Result<XaVote, ProxyError> {
        let (state, rollback_only) = self
            .branches
            .get(xid)
            .map(|ctx| (ctx.state, ctx.rollback_only))
            .ok_or_else(|| not_found(xid))?;
        if rollback_only {
            return Err(ProxyError::xa(
                XaErrorCode::Proto,
                format!("branch {xid} is rollback-only"),
            ));
        }
        if !state.can_transition_to(TxState::Prepared) {
            return Err(ProxyError::xa(
                XaErrorCode::Proto,
                format!("cannot prepare branch {xid} in state {state}"),
            ));
        }

        let conn = bound_connection(backend)?;
        match conn.xa_prepare(xid).await {
            Ok(vote) => {
                let next = match vote {
                    XaVote::ReadOnly => TxState::Committed,
                    XaVote::Ok => TxState::Prepared,
                };
                if self.advance(xid, session, next)? {
                    backend.branch_completed();
                }
                Ok(vote)
            }
            Err(err) => {
                if self.advance(xid, session, TxState::Indeterminate)? {
                    backend.branch_completed();
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_xa_heuristic();
                }
                error!(
                    target_name = %self.target,
                    xid = %xid,
                    phase = "prepare",
                    error = %err,
                    "XA branch left indeterminate, manual reconciliation required"
                );
                Err(ProxyError::HeuristicXaOutcome {
                    xid: xid.to_string(),
                    target: self.target.clone(),
                    phase: "prepare".to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Second phase, or one-phase commit of an ended branch
    ///
    /// Committing an already committed branch is a no-op. A prepared xid this
    /// node has no record of (e.g. after a restart) is committed directly.
    ///
    /// # Errors
    ///
    /// `XAER_NOTA`/`XAER_PROTO` for protocol violations, or the driver's error.
    pub async fn commit(
        &self,
        session: SessionId,
        backend: &mut XaBackendSession,
        xid: &Xid,
        one_phase: bool,
    ) -> Result<(), ProxyError> {
        let Some(state) = self.state(xid) else {
            if one_phase {
                return Err(not_found(xid));
            }
            let conn = bound_connection(backend)?;
            return conn
                .xa_commit(xid, false)
                .await
                .map_err(|e| driver_error(xid, e));
        };

        match state {
            TxState::Committed => return Ok(()),
            TxState::Ended if one_phase => {}
            TxState::Prepared if !one_phase => {}
            _ => {
                return Err(ProxyError::xa(
                    XaErrorCode::Proto,
                    format!(
                        "cannot {} commit branch {xid} in state {state}",
                        if one_phase { "one-phase" } else { "two-phase" }
                    ),
                ));
            }
        }
        if self
            .branches
            .get(xid)
            .is_some_and(|ctx| ctx.rollback_only)
        {
            return Err(ProxyError::xa(
                XaErrorCode::Proto,
                format!("branch {xid} is rollback-only"),
            ));
        }

        let conn = bound_connection(backend)?;
        conn.xa_commit(xid, one_phase)
            .await
            .map_err(|e| driver_error(xid, e))?;
        if self.advance(xid, session, TxState::Committed)? {
            backend.branch_completed();
        }
        debug!(target_name = %self.target, xid = %xid, one_phase, "XA branch committed");
        Ok(())
    }

    /// Roll back a branch in any non-committed state; repeated calls are no-ops
    ///
    /// # Errors
    ///
    /// `XAER_PROTO` for a committed branch, or the driver's error.
    pub async fn rollback(
        &self,
        session: SessionId,
        backend: &mut XaBackendSession,
        xid: &Xid,
    ) -> Result<(), ProxyError> {
        let Some(state) = self.state(xid) else {
            let conn = bound_connection(backend)?;
            return conn.xa_rollback(xid).await.map_err(|e| driver_error(xid, e));
        };

        match state {
            TxState::RolledBack => return Ok(()),
            TxState::Committed => {
                return Err(ProxyError::xa(
                    XaErrorCode::Proto,
                    format!("branch {xid} already committed"),
                ));
            }
            _ => {}
        }

        let conn = bound_connection(backend)?;
        if state == TxState::Active {
            // Best effort: dissociate before rolling back
            let _ = conn.xa_end(xid, EndFlag::Fail).await;
        }
        conn.xa_rollback(xid)
            .await
            .map_err(|e| driver_error(xid, e))?;
        if self.advance(xid, session, TxState::RolledBack)? {
            backend.branch_completed();
        }
        debug!(target_name = %self.target, xid = %xid, "XA branch rolled back");
        Ok(())
    }

    /// Prepared branches as reported by the resource manager
    ///
    /// # Errors
    ///
    /// The driver's error.
    pub async fn recover(&self, conn: &mut dyn BackendConnection) -> Result<Vec<Xid>, ProxyError> {
        conn.xa_recover()
            .await
            .map_err(|e| ProxyError::xa(XaErrorCode::RmErr, e.to_string()))
    }

    /// Drop an indeterminate branch once an operator has reconciled it
    ///
    /// # Errors
    ///
    /// `XAER_NOTA` unless the branch is indeterminate.
    pub async fn forget(&self, conn: &mut dyn BackendConnection, xid: &Xid) -> Result<(), ProxyError> {
        if self.state(xid) != Some(TxState::Indeterminate) {
            return Err(not_found(xid));
        }
        match conn.xa_forget(xid).await {
            Ok(()) | Err(DriverError::Unsupported(_)) => {}
            Err(err) => return Err(driver_error(xid, err)),
        }
        self.branches.remove(xid);
        warn!(target_name = %self.target, xid = %xid, "Forgot indeterminate XA branch");
        Ok(())
    }

    /// Roll back every unfinished branch owned by `session`
    ///
    /// Prepared and indeterminate branches are left for the transaction
    /// manager or an operator.
    pub async fn abandon(&self, session: SessionId, backend: &mut XaBackendSession) {
        let open: Vec<Xid> = self
            .branches
            .iter()
            .filter(|ctx| {
                ctx.owner == session && matches!(ctx.state, TxState::Active | TxState::Ended)
            })
            .map(|ctx| ctx.xid.clone())
            .collect();
        for xid in open {
            if let Err(e) = self.rollback(session, backend, &xid).await {
                warn!(target_name = %self.target, xid = %xid, error = %e, "Failed to roll back abandoned XA branch");
            }
        }
    }
}
