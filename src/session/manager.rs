//! Session registry and per-session operations
//!
//! Sessions do not hold a backend connection until a statement needs one. A
//! bound connection goes back to its pool as soon as no transaction is open
//! and no cursor is left unconsumed; inside a transaction the same connection
//! serves every statement until commit or rollback.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::state::{Session, SessionSnapshot};
use super::{SessionSettings, StatementResult};
use crate::backend::{CancelHandle, IsolationLevel, RowBlock, StatementOutcome, Value};
use crate::error::{DriverError, ProxyError, millis};
use crate::metrics::MetricsCollector;
use crate::node::TargetRuntime;
use crate::segregation::OperationSignature;
use crate::types::{ClientId, ConnHash, ConnectionHandle, CursorId, SessionId};
use crate::xa::{EndFlag, StartFlag, XaVote, Xid};

#[derive(Debug)]
struct SessionEntry {
    target: Arc<TargetRuntime>,
    client: ClientId,
    session: tokio::sync::Mutex<Session>,
    /// Cancel handle of the statement in flight, reachable without the session lock
    in_flight: Mutex<Option<Arc<dyn CancelHandle>>>,
}

impl SessionEntry {
    fn set_in_flight(&self, handle: Option<Arc<dyn CancelHandle>>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }
}

/// All sessions open on a node
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    settings: SessionSettings,
    metrics: MetricsCollector,
}

impl SessionManager {
    pub fn new(settings: SessionSettings, metrics: MetricsCollector) -> Self {
        Self {
            sessions: DashMap::new(),
            settings,
            metrics,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn entry(&self, id: SessionId) -> Result<Arc<SessionEntry>, ProxyError> {
        self.sessions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ProxyError::SessionNotFound(id.to_string()))
    }

    /// Register a session; no backend connection is taken yet
    ///
    /// # Errors
    ///
    /// `XAER_RMERR` when an XA session is requested for a target without XA.
    pub fn open_session(
        &self,
        target: Arc<TargetRuntime>,
        client: ClientId,
        xa: bool,
    ) -> Result<SessionId, ProxyError> {
        if xa && !target.supports_xa() {
            return Err(ProxyError::xa(
                crate::error::XaErrorCode::RmErr,
                format!("XA is not enabled for '{}'", target.name()),
            ));
        }
        let session = Session::new(target, client, xa);
        let id = session.id;
        debug!(session = %id, client = %client, target_name = session.target.name(), xa, "Session opened");
        self.sessions.insert(
            id,
            Arc::new(SessionEntry {
                target: session.target.clone(),
                client,
                session: tokio::sync::Mutex::new(session),
                in_flight: Mutex::new(None),
            }),
        );
        self.metrics.session_opened();
        Ok(id)
    }

    /// Target a session was opened against, without waiting on the session
    #[must_use]
    pub fn target_of(&self, id: SessionId) -> Option<Arc<TargetRuntime>> {
        self.sessions.get(&id).map(|e| e.target.clone())
    }

    /// Whether `client` still has a session on the target `conn_hash`
    #[must_use]
    pub fn has_client_sessions(&self, client: ClientId, conn_hash: &ConnHash) -> bool {
        self.sessions
            .iter()
            .any(|e| e.client == client && e.target.conn_hash() == conn_hash)
    }

    #[must_use]
    pub async fn snapshot(&self, id: SessionId) -> Option<SessionSnapshot> {
        let entry = self.entry(id).ok()?;
        let session = entry.session.lock().await;
        Some(session.snapshot())
    }

    /// Make sure a connection serves the session, opening the lazy transaction
    async fn ensure_connection(
        session: &mut Session,
        signature: &OperationSignature,
    ) -> Result<(), ProxyError> {
        let target = session.target.clone();
        if let Some(xa) = session.xa.as_mut() {
            if !xa.is_attached() {
                xa.attach(target.acquire_xa().await?);
            }
            return Ok(());
        }

        if session.bound.is_none() {
            let lease = target.acquire(signature).await?;
            debug!(
                session = %session.id,
                handle = %lease.lease.handle(),
                kind = %lease.kind(),
                borrowed = lease.is_borrowed(),
                "Bound backend connection"
            );
            session.bound = Some(lease);
        }

        if session.tx_requested && !session.backend_tx_open {
            let isolation = session.isolation;
            let id = session.id;
            let name = target.name().to_string();
            if let Some(conn) = session.connection() {
                conn.begin(isolation)
                    .await
                    .map_err(|e| Self::driver_error(id, &name, e))?;
            }
            session.backend_tx_open = true;
        }
        Ok(())
    }

    fn driver_error(id: SessionId, target: &str, err: DriverError) -> ProxyError {
        match err {
            DriverError::Cancelled => ProxyError::Cancelled(id.to_string()),
            DriverError::Xa { code, message } => ProxyError::Xa { code, message },
            other => ProxyError::Backend {
                target: target.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Turn a failed backend call into the caller's error, dropping a broken connection
    fn backend_failed(session: &mut Session, err: DriverError) -> ProxyError {
        let name = session.target.name().to_string();
        if !err.is_connection_broken() {
            session.release_if_idle();
            return Self::driver_error(session.id, &name, err);
        }

        warn!(session = %session.id, target_name = %name, error = %err, "Discarding broken backend connection");
        let in_transaction = session.tx_requested;
        session.discard_connection();
        if in_transaction {
            session.tx_requested = false;
            return ProxyError::transaction(
                session.id,
                format!("transaction aborted, backend connection lost: {err}"),
            );
        }
        Self::driver_error(session.id, &name, err)
    }

    /// Take a connection for the session now
    ///
    /// # Errors
    ///
    /// Acquisition errors from the target.
    pub async fn bind_connection(&self, id: SessionId) -> Result<ConnectionHandle, ProxyError> {
        let entry = self.entry(id)?;
        let mut session = entry.session.lock().await;
        session.ensure_open()?;
        Self::ensure_connection(&mut session, &OperationSignature::of("")).await?;
        session.touch();
        session
            .bound_handle()
            .ok_or_else(|| ProxyError::SessionClosed(id.to_string()))
    }

    /// Run one statement
    ///
    /// # Errors
    ///
    /// Acquisition errors, `StatementTimeout`, `Cancelled`, `Backend` for a
    /// rejected statement, or `TransactionState` when a broken connection took
    /// an open transaction with it.
    pub async fn execute(
        &self,
        id: SessionId,
        sql: &str,
        params: &[Value],
        fetch_size: usize,
    ) -> Result<StatementResult, ProxyError> {
        let entry = self.entry(id)?;
        let mut session = entry.session.lock().await;
        session.ensure_open()?;
        let signature = OperationSignature::of(sql);
        Self::ensure_connection(&mut session, &signature).await?;

        let target = session.target.clone();
        let timeout = self.settings.statement_timeout;
        let Some(conn) = session.connection() else {
            return Err(ProxyError::SessionClosed(id.to_string()));
        };
        let handle = conn.handle();
        let cancel = conn.cancel_handle();
        entry.set_in_flight(cancel.clone());

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, conn.execute(sql, params, fetch_size)).await;
        let warnings = conn.take_warnings();
        entry.set_in_flight(None);
        target
            .segregator()
            .record_execution(&signature, started.elapsed());
        self.metrics.record_statement();
        session.touch();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
                warn!(session = %id, target_name = target.name(), timeout_ms = millis(timeout), "Statement timed out");
                session.release_if_idle();
                return Err(ProxyError::StatementTimeout {
                    session: id.to_string(),
                    timeout_ms: millis(timeout),
                });
            }
        };

        let result = match outcome {
            Ok(StatementOutcome::Update {
                count,
                generated_keys,
            }) => StatementResult {
                update_count: Some(count),
                generated_keys,
                cursor: None,
                columns: Vec::new(),
                rows: RowBlock::default(),
                warnings,
                connection: handle,
            },
            Ok(StatementOutcome::Rows {
                cursor,
                columns,
                first,
            }) => {
                let cursor_id = (!first.done).then(|| {
                    let cursor_id = CursorId::new();
                    session.cursors.insert(cursor_id, cursor);
                    cursor_id
                });
                StatementResult {
                    update_count: None,
                    generated_keys: Vec::new(),
                    cursor: cursor_id,
                    columns,
                    rows: first,
                    warnings,
                    connection: handle,
                }
            }
            Err(err) => return Err(Self::backend_failed(&mut session, err)),
        };

        session.release_if_idle();
        Ok(result)
    }

    /// Next block of rows from an open cursor
    ///
    /// # Errors
    ///
    /// `CursorNotFound`, or the backend's error.
    pub async fn fetch(
        &self,
        id: SessionId,
        cursor: CursorId,
        max_rows: usize,
    ) -> Result<RowBlock, ProxyError> {
        let entry = self.entry(id)?;
        let mut session = entry.session.lock().await;
        session.ensure_open()?;
        let Some(&backend_cursor) = session.cursors.get(&cursor) else {
            return Err(ProxyError::CursorNotFound {
                session: id.to_string(),
                cursor: cursor.to_string(),
            });
        };
        let Some(conn) = session.connection() else {
            return Err(ProxyError::SessionClosed(id.to_string()));
        };
        let fetched = conn.fetch(backend_cursor, max_rows).await;
        session.touch();

        match fetched {
            Ok(block) => {
                if block.done {
                    session.cursors.remove(&cursor);
                    session.release_if_idle();
                }
                Ok(block)
            }
            Err(err) => {
                session.cursors.remove(&cursor);
                Err(Self::backend_failed(&mut session, err))
            }
        }
    }

    /// Close a cursor before it is exhausted; unknown cursors are ignored
    ///
    /// # Errors
    ///
    /// `SessionNotFound` or `SessionClosed`.
    pub async fn close_cursor(&self, id: SessionId, cursor: CursorId) -> Result<(), ProxyError> {
        let entry = self.entry(id)?;
        let mut session = entry.session.lock().await;
        session.ensure_open()?;
        if let Some(backend_cursor) = session.cursors.remove(&cursor)
            && let Some(conn) = session.connection()
            && let Err(e) = conn.close_cursor(backend_cursor).await
        {
            debug!(session = %id, error = %e, "Backend cursor close failed");
        }
        session.touch();
        session.release_if_idle();
        Ok(())
    }

    /// Start a transaction; the backend `begin` waits for the first statement
    ///
    /// # Errors
    ///
    /// `TransactionState` on an XA session.
    pub async fn begin_tx(&self, id: SessionId) -> Result<(), ProxyError> {
        let entry = self.entry(id)?;
        let mut session = entry.session.lock().await;
        session.ensure_open()?;
        if session.xa.is_some() {
            return Err(ProxyError::transaction(
                id,
                "local transactions are not available on an XA session",
            ));
        }
        session.tx_requested = true;
        session.touch();
        Ok(())
    }

    async fn end_tx(&self, id: SessionId, commit: bool) -> Result<(), ProxyError> {
        let entry = self.entry(id)?;
        let mut session = entry.session.lock().await;
        session.ensure_open()?;
        if !session.tx_requested {
            return Err(ProxyError::transaction(id, "no transaction is open"));
        }

        let mut result = Ok(());
        if session.backend_tx_open
            && let Some(conn) = session.connection()
        {
            let ended = if commit {
                conn.commit().await
            } else {
                conn.rollback().await
            };
            if let Err(err) = ended {
                result = Err(Self::backend_failed(&mut session, err));
            }
        }
        session.tx_requested = false;
        session.backend_tx_open = false;
        session.touch();
        session.release_if_idle();
        result
    }

    /// # Errors
    ///
    /// `TransactionState` without an open transaction, or the backend's error.
    pub async fn commit(&self, id: SessionId) -> Result<(), ProxyError> {
        self.end_tx(id, true).await
    }

    /// # Errors
    ///
    /// `TransactionState` without an open transaction, or the backend's error.
    pub async fn rollback(&self, id: SessionId) -> Result<(), ProxyError> {
        self.end_tx(id, false).await
    }

    /// # Errors
    ///
    /// `TransactionState` inside an open transaction.
    pub async fn set_isolation(&self, id: SessionId, level: IsolationLevel) -> Result<(), ProxyError> {
        let entry = self.entry(id)?;
        let mut session = entry.session.lock().await;
        session.ensure_open()?;
        if session.tx_requested {
            return Err(ProxyError::transaction(
                id,
                "isolation cannot change inside a transaction",
            ));
        }
        session.isolation = level;
        Ok(())
    }

    /// Best-effort cancel of the statement in flight
    ///
    /// Returns whether a statement was running.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`.
    pub fn cancel(&self, id: SessionId) -> Result<bool, ProxyError> {
        let entry = self.entry(id)?;
        let handle = entry
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handle {
            Some(handle) => {
                debug!(session = %id, "Cancelling in-flight statement");
                handle.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release everything the session holds
    ///
    /// Returns whether the session can leave the registry. An XA session whose
    /// branch is still incomplete keeps its backend session until the branch
    /// completes.
    async fn teardown(&self, session: &mut Session, reaped: bool) -> bool {
        let id = session.id;
        if !session.closed {
            session.closed = true;
            if reaped {
                self.metrics.session_reaped();
            } else {
                self.metrics.session_closed();
            }
        }

        let cursors: Vec<_> = session.cursors.drain().map(|(_, c)| c).collect();
        let rollback = session.backend_tx_open;
        if let Some(conn) = session.connection() {
            for cursor in cursors {
                let _ = conn.close_cursor(cursor).await;
            }
            if rollback && let Err(e) = conn.rollback().await {
                debug!(session = %id, error = %e, "Rollback on close failed");
            }
        }
        session.tx_requested = false;
        session.backend_tx_open = false;
        session.bound = None;

        let target = session.target.clone();
        let Some(xa) = session.xa.as_mut() else {
            return true;
        };
        if reaped {
            let had_open_branch = xa.has_incomplete_branch();
            target.xa_registry().abandon(id, xa).await;
            if let Some(lease) = xa.detach() {
                if had_open_branch {
                    lease.discard();
                }
            }
            return true;
        }

        xa.close_wrapper();
        if let Some(lease) = xa.take_releasable() {
            drop(lease);
            return true;
        }
        if xa.is_attached() {
            debug!(session = %id, state = %xa.state(), "XA connection closed with branch in progress, keeping backend session");
            return false;
        }
        true
    }

    /// Close a session; closing an unknown or closed session is a no-op
    pub async fn close_session(&self, id: SessionId) {
        let Ok(entry) = self.entry(id) else {
            return;
        };
        let mut session = entry.session.lock().await;
        if session.closed && session.xa.as_ref().is_none_or(|xa| !xa.is_attached()) {
            return;
        }
        if self.teardown(&mut session, false).await {
            self.sessions.remove(&id);
            debug!(session = %id, "Session closed");
        }
    }

    /// Close every session, e.g. at shutdown
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Ok(entry) = self.entry(id) {
                let mut session = entry.session.lock().await;
                self.teardown(&mut session, true).await;
            }
            self.sessions.remove(&id);
        }
    }

    /// Close sessions idle for at least `idle_timeout`
    ///
    /// Sessions in the middle of an operation are skipped.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let entries: Vec<(SessionId, Arc<SessionEntry>)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut reaped = 0;
        for (id, entry) in entries {
            let Ok(mut session) = entry.session.try_lock() else {
                continue;
            };
            let idle = session.last_activity.elapsed();
            if idle < idle_timeout {
                continue;
            }
            warn!(
                session = %id,
                client = %session.client,
                target_name = session.target.name(),
                idle_ms = millis(idle),
                in_transaction = session.tx_requested,
                "Reaping idle session"
            );
            self.teardown(&mut session, true).await;
            drop(session);
            self.sessions.remove(&id);
            reaped += 1;
        }
        if reaped > 0 {
            info!(reaped, remaining = self.sessions.len(), "Reaped idle sessions");
        }
        reaped
    }

    async fn xa_session(
        &self,
        id: SessionId,
        allow_closed: bool,
    ) -> Result<(Arc<SessionEntry>, Arc<TargetRuntime>), ProxyError> {
        let entry = self.entry(id)?;
        let (target, closed, is_xa) = {
            let session = entry.session.lock().await;
            (session.target.clone(), session.closed, session.xa.is_some())
        };
        if !is_xa {
            return Err(ProxyError::xa(
                crate::error::XaErrorCode::Proto,
                format!("session {id} is not XA-enabled"),
            ));
        }
        if closed && !allow_closed {
            return Err(ProxyError::SessionClosed(id.to_string()));
        }
        Ok((entry, target))
    }

    /// Return the backend session once a closed XA connection's branch completes
    fn settle_xa(&self, session: &mut Session) {
        if !session.closed {
            return;
        }
        let id = session.id;
        if let Some(xa) = session.xa.as_mut()
            && let Some(lease) = xa.take_releasable()
        {
            drop(lease);
            self.sessions.remove(&id);
            debug!(session = %id, "XA session released after branch completion");
        }
    }

    /// # Errors
    ///
    /// XA protocol errors, or acquisition errors for the XA backend session.
    pub async fn xa_start(&self, id: SessionId, xid: &Xid, flag: StartFlag) -> Result<(), ProxyError> {
        let (entry, target) = self.xa_session(id, false).await?;
        let mut session = entry.session.lock().await;
        Self::ensure_connection(&mut session, &OperationSignature::of("")).await?;
        let xa = session.xa_mut()?;
        target.xa_registry().start(id, xa, xid, flag).await?;
        session.touch();
        Ok(())
    }

    /// # Errors
    ///
    /// XA protocol errors.
    pub async fn xa_end(&self, id: SessionId, xid: &Xid, flag: EndFlag) -> Result<(), ProxyError> {
        let (entry, target) = self.xa_session(id, true).await?;
        let mut session = entry.session.lock().await;
        let xa = session.xa_mut()?;
        target.xa_registry().end(xa, xid, flag).await?;
        session.touch();
        Ok(())
    }

    /// # Errors
    ///
    /// XA protocol errors or `HeuristicXaOutcome`.
    pub async fn xa_prepare(&self, id: SessionId, xid: &Xid) -> Result<XaVote, ProxyError> {
        let (entry, target) = self.xa_session(id, true).await?;
        let mut session = entry.session.lock().await;
        let xa = session.xa_mut()?;
        let result = target.xa_registry().prepare(id, xa, xid).await;
        session.touch();
        self.settle_xa(&mut session);
        result
    }

    /// # Errors
    ///
    /// XA protocol errors, or the backend's error.
    pub async fn xa_commit(
        &self,
        id: SessionId,
        xid: &Xid,
        one_phase: bool,
    ) -> Result<(), ProxyError> {
        let (entry, target) = self.xa_session(id, true).await?;
        let mut session = entry.session.lock().await;
        Self::ensure_connection(&mut session, &OperationSignature::of("")).await?;
        let xa = session.xa_mut()?;
        let result = target.xa_registry().commit(id, xa, xid, one_phase).await;
        session.touch();
        self.settle_xa(&mut session);
        result
    }

    /// # Errors
    ///
    /// XA protocol errors, or the backend's error.
    pub async fn xa_rollback(&self, id: SessionId, xid: &Xid) -> Result<(), ProxyError> {
        let (entry, target) = self.xa_session(id, true).await?;
        let mut session = entry.session.lock().await;
        Self::ensure_connection(&mut session, &OperationSignature::of("")).await?;
        let xa = session.xa_mut()?;
        let result = target.xa_registry().rollback(id, xa, xid).await;
        session.touch();
        self.settle_xa(&mut session);
        result
    }

    /// Prepared branches known to the resource manager
    ///
    /// # Errors
    ///
    /// Acquisition errors, or the backend's error.
    pub async fn xa_recover(&self, id: SessionId) -> Result<Vec<Xid>, ProxyError> {
        let (entry, target) = self.xa_session(id, true).await?;
        let mut session = entry.session.lock().await;
        Self::ensure_connection(&mut session, &OperationSignature::of("")).await?;
        let Some(conn) = session.connection() else {
            return Err(ProxyError::SessionClosed(id.to_string()));
        };
        let result = target.xa_registry().recover(conn).await;
        self.settle_xa(&mut session);
        result
    }

    /// # Errors
    ///
    /// `XAER_NOTA` unless the branch is indeterminate.
    pub async fn xa_forget(&self, id: SessionId, xid: &Xid) -> Result<(), ProxyError> {
        let (entry, target) = self.xa_session(id, true).await?;
        let mut session = entry.session.lock().await;
        Self::ensure_connection(&mut session, &OperationSignature::of("")).await?;
        let Some(conn) = session.connection() else {
            return Err(ProxyError::SessionClosed(id.to_string()));
        };
        target.xa_registry().forget(conn, xid).await
    }

    /// # Errors
    ///
    /// `SessionNotFound` or not an XA session.
    pub async fn xa_set_transaction_timeout(
        &self,
        id: SessionId,
        timeout: Duration,
    ) -> Result<(), ProxyError> {
        let (entry, _) = self.xa_session(id, false).await?;
        let mut session = entry.session.lock().await;
        session.xa_mut()?.set_transaction_timeout(timeout);
        Ok(())
    }

    /// # Errors
    ///
    /// `SessionNotFound` or not an XA session.
    pub async fn xa_transaction_timeout(&self, id: SessionId) -> Result<Duration, ProxyError> {
        let (entry, _) = self.xa_session(id, true).await?;
        let mut session = entry.session.lock().await;
        Ok(session.xa_mut()?.transaction_timeout())
    }
}
