//! In-process scripted database
//!
//! Used by the default node configuration, demos and tests. It understands a
//! handful of statements instead of SQL:
//!
//! - `sleep <ms>` waits (cancellable) and reports no rows changed
//! - `rows <n>` opens a cursor over `n` single-column rows
//! - `fail <message>` fails the statement
//! - `break` fails and leaves the connection unusable
//! - `warn <message>` succeeds with a warning
//! - anything else is a write, buffered until commit inside a transaction

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use super::{
    BackendConnection, BackendCursor, BackendDriver, BackendTarget, CancelHandle, IsolationLevel,
    Row, RowBlock, StatementOutcome, Value,
};
use crate::error::{DriverError, XaErrorCode};
use crate::types::ConnectionHandle;
use crate::xa::{EndFlag, StartFlag, XaVote, Xid};

#[derive(Debug, Default)]
struct MemoryState {
    available: AtomicBool,
    fail_prepare: AtomicBool,
    connects: AtomicU64,
    live: AtomicUsize,
    connect_latency_ms: AtomicU64,
    next_key: AtomicU64,
    committed: Mutex<Vec<String>>,
    prepared: Mutex<HashMap<Xid, Vec<String>>>,
}

/// Scripted in-memory backend; clones share the same database state
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    name: String,
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let state = MemoryState {
            available: AtomicBool::new(true),
            ..Default::default()
        };
        Self {
            name: name.into(),
            state: Arc::new(state),
        }
    }

    /// Make new connects (and validation of existing connections) fail
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Make the next prepare calls fail with a resource manager error
    pub fn set_fail_prepare(&self, fail: bool) {
        self.state.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state.connect_latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of successful physical connects so far
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Writes that have been committed, in commit order
    #[must_use]
    pub fn committed(&self) -> Vec<String> {
        self.state
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Branches prepared but not yet resolved
    #[must_use]
    pub fn prepared(&self) -> Vec<Xid> {
        self.state
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BackendDriver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        target: &BackendTarget,
    ) -> Result<Box<dyn BackendConnection>, DriverError> {
        let latency = self.state.connect_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(DriverError::Connect(format!(
                "{} refused connection",
                target.url
            )));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection::new(self.state.clone())))
    }
}

#[derive(Debug, Default)]
struct MemoryCancel {
    waiter: Mutex<Option<oneshot::Sender<()>>>,
}

impl MemoryCancel {
    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn disarm(&self) {
        self.waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl CancelHandle for MemoryCancel {
    fn cancel(&self) {
        if let Some(tx) = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug)]
struct MemoryConnection {
    handle: ConnectionHandle,
    state: Arc<MemoryState>,
    in_tx: bool,
    pending: Vec<String>,
    cursors: HashMap<u64, VecDeque<Row>>,
    next_cursor: u64,
    broken: bool,
    cancel: Arc<MemoryCancel>,
    warnings: Vec<String>,
    active_branch: Option<Xid>,
    branches: HashMap<Xid, Vec<String>>,
}

impl MemoryConnection {
    fn new(state: Arc<MemoryState>) -> Self {
        Self {
            handle: ConnectionHandle::next(),
            state,
            in_tx: false,
            pending: Vec::new(),
            cursors: HashMap::new(),
            next_cursor: 1,
            broken: false,
            cancel: Arc::new(MemoryCancel::default()),
            warnings: Vec::new(),
            active_branch: None,
            branches: HashMap::new(),
        }
    }

    fn ensure_usable(&self) -> Result<(), DriverError> {
        if self.broken {
            Err(DriverError::Broken("connection previously failed".into()))
        } else {
            Ok(())
        }
    }

    fn commit_writes(&self, writes: Vec<String>) {
        self.state
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(writes);
    }

    fn take_block(rows: &mut VecDeque<Row>, max_rows: usize) -> RowBlock {
        let take = max_rows.max(1).min(rows.len());
        let block: Vec<Row> = rows.drain(..take).collect();
        RowBlock {
            rows: block,
            done: rows.is_empty(),
        }
    }

    fn record_write(&mut self, sql: &str) {
        let write = sql.to_string();
        if let Some(xid) = &self.active_branch {
            self.branches.entry(xid.clone()).or_default().push(write);
        } else if self.in_tx {
            self.pending.push(write);
        } else {
            self.commit_writes(vec![write]);
        }
    }

    fn xa_error(code: XaErrorCode, message: impl Into<String>) -> DriverError {
        DriverError::Xa {
            code,
            message: message.into(),
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    async fn execute(
        &mut self,
        sql: &str,
        _params: &[Value],
        fetch_size: usize,
    ) -> Result<StatementOutcome, DriverError> {
        self.ensure_usable()?;
        let trimmed = sql.trim();
        let (verb, rest) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(v, r)| (v, r.trim()));

        match verb.to_ascii_lowercase().as_str() {
            "sleep" => {
                let millis: u64 = rest
                    .parse()
                    .map_err(|_| DriverError::Statement(format!("bad sleep duration '{rest}'")))?;
                let cancelled = self.cancel.arm();
                let outcome = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(()),
                    _ = cancelled => Err(DriverError::Cancelled),
                };
                self.cancel.disarm();
                outcome?;
                Ok(StatementOutcome::Update {
                    count: 0,
                    generated_keys: Vec::new(),
                })
            }
            "rows" => {
                let count: i64 = rest
                    .parse()
                    .map_err(|_| DriverError::Statement(format!("bad row count '{rest}'")))?;
                let mut rows: VecDeque<Row> = (1..=count).map(|i| vec![Value::Int(i)]).collect();
                let first = Self::take_block(&mut rows, fetch_size);
                let cursor = BackendCursor(self.next_cursor);
                self.next_cursor += 1;
                if !first.done {
                    self.cursors.insert(cursor.0, rows);
                }
                Ok(StatementOutcome::Rows {
                    cursor,
                    columns: vec!["n".to_string()],
                    first,
                })
            }
            "fail" => Err(DriverError::Statement(rest.to_string())),
            "break" => {
                self.broken = true;
                Err(DriverError::Broken("backend closed the connection".into()))
            }
            "warn" => {
                self.warnings.push(rest.to_string());
                Ok(StatementOutcome::Update {
                    count: 0,
                    generated_keys: Vec::new(),
                })
            }
            _ => {
                self.record_write(trimmed);
                let key = self.state.next_key.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(StatementOutcome::Update {
                    count: 1,
                    generated_keys: vec![Value::Int(i64::try_from(key).unwrap_or(i64::MAX))],
                })
            }
        }
    }

    async fn fetch(
        &mut self,
        cursor: BackendCursor,
        max_rows: usize,
    ) -> Result<RowBlock, DriverError> {
        self.ensure_usable()?;
        let Some(rows) = self.cursors.get_mut(&cursor.0) else {
            return Ok(RowBlock {
                rows: Vec::new(),
                done: true,
            });
        };
        let block = Self::take_block(rows, max_rows);
        if block.done {
            self.cursors.remove(&cursor.0);
        }
        Ok(block)
    }

    async fn close_cursor(&mut self, cursor: BackendCursor) -> Result<(), DriverError> {
        self.cursors.remove(&cursor.0);
        Ok(())
    }

    async fn begin(&mut self, _isolation: IsolationLevel) -> Result<(), DriverError> {
        self.ensure_usable()?;
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.ensure_usable()?;
        let writes = std::mem::take(&mut self.pending);
        self.commit_writes(writes);
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.pending.clear();
        self.in_tx = false;
        Ok(())
    }

    async fn is_valid(&mut self) -> bool {
        !self.broken && self.state.available.load(Ordering::SeqCst)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        Some(self.cancel.clone())
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    async fn xa_start(&mut self, xid: &Xid, flag: StartFlag) -> Result<(), DriverError> {
        self.ensure_usable()?;
        match flag {
            StartFlag::NoFlags => {
                self.branches.entry(xid.clone()).or_default();
            }
            StartFlag::Join | StartFlag::Resume => {
                if !self.branches.contains_key(xid) {
                    return Err(Self::xa_error(XaErrorCode::Nota, xid.to_string()));
                }
            }
        }
        self.active_branch = Some(xid.clone());
        Ok(())
    }

    async fn xa_end(&mut self, xid: &Xid, _flag: EndFlag) -> Result<(), DriverError> {
        if self.active_branch.as_ref() == Some(xid) {
            self.active_branch = None;
        }
        Ok(())
    }

    async fn xa_prepare(&mut self, xid: &Xid) -> Result<XaVote, DriverError> {
        if self.state.fail_prepare.load(Ordering::SeqCst) {
            return Err(Self::xa_error(
                XaErrorCode::RmErr,
                "resource manager failed during prepare",
            ));
        }
        let writes = self.branches.remove(xid).unwrap_or_default();
        if writes.is_empty() {
            return Ok(XaVote::ReadOnly);
        }
        self.state
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(xid.clone(), writes);
        Ok(XaVote::Ok)
    }

    async fn xa_commit(&mut self, xid: &Xid, one_phase: bool) -> Result<(), DriverError> {
        let writes = if one_phase {
            self.branches.remove(xid)
        } else {
            self.state
                .prepared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(xid)
        };
        match writes {
            Some(writes) => {
                self.commit_writes(writes);
                Ok(())
            }
            None => Err(Self::xa_error(XaErrorCode::Nota, xid.to_string())),
        }
    }

    async fn xa_rollback(&mut self, xid: &Xid) -> Result<(), DriverError> {
        self.branches.remove(xid);
        self.state
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(xid);
        if self.active_branch.as_ref() == Some(xid) {
            self.active_branch = None;
        }
        Ok(())
    }

    async fn xa_recover(&mut self) -> Result<Vec<Xid>, DriverError> {
        Ok(self
            .state
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    async fn xa_forget(&mut self, xid: &Xid) -> Result<(), DriverError> {
        self.state
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(xid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> BackendTarget {
        BackendTarget {
            name: "mem".to_string(),
            url: "memory://test".to_string(),
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn test_connect_counts_and_live_tracking() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.connect(&target()).await.unwrap();
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(driver.live_connections(), 1);
        drop(conn);
        assert_eq!(driver.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_driver_refuses() {
        let driver = MemoryDriver::new("memory");
        driver.set_available(false);
        let err = driver.connect(&target()).await.unwrap_err();
        assert!(err.is_connection_broken());
        assert_eq!(driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_rows_cursor_iterates_in_blocks() {
        let driver = MemoryDriver::new("memory");
        let mut conn = driver.connect(&target()).await.unwrap();
        let StatementOutcome::Rows { cursor, first, .. } =
            conn.execute("rows 5", &[], 2).await.unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(first.rows.len(), 2);
        assert!(!first.done);

        let second = conn.fetch(cursor, 2).await.unwrap();
        assert_eq!(second.rows, vec![vec![Value::Int(3)], vec![Value::Int(4)]]);
        let last = conn.fetch(cursor, 2).await.unwrap();
        assert_eq!(last.rows.len(), 1);
        assert!(last.done);
    }

    #[tokio::test]
    async fn test_small_result_is_done_in_first_block() {
        let driver = MemoryDriver::new("memory");
        let mut conn = driver.connect(&target()).await.unwrap();
        let outcome = conn.execute("rows 2", &[], 10).await.unwrap();
        assert!(matches!(outcome, StatementOutcome::Rows { first, .. } if first.done));
    }

    #[tokio::test]
    async fn test_transaction_buffers_until_commit() {
        let driver = MemoryDriver::new("memory");
        let mut conn = driver.connect(&target()).await.unwrap();
        conn.begin(IsolationLevel::Serializable).await.unwrap();
        conn.execute("insert a", &[], 10).await.unwrap();
        assert!(driver.committed().is_empty());
        conn.commit().await.unwrap();
        assert_eq!(driver.committed(), vec!["insert a".to_string()]);

        conn.begin(IsolationLevel::ReadCommitted).await.unwrap();
        conn.execute("insert b", &[], 10).await.unwrap();
        conn.rollback().await.unwrap();
        assert_eq!(driver.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_break_poisons_connection() {
        let driver = MemoryDriver::new("memory");
        let mut conn = driver.connect(&target()).await.unwrap();
        assert!(conn.execute("break", &[], 1).await.unwrap_err().is_connection_broken());
        assert!(!conn.is_valid().await);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let driver = MemoryDriver::new("memory");
        let mut conn = driver.connect(&target()).await.unwrap();
        let cancel = conn.cancel_handle().unwrap();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = conn.execute("sleep 5000", &[], 1).await.unwrap_err();
        assert_eq!(err, DriverError::Cancelled);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_xa_two_phase_commit() {
        let driver = MemoryDriver::new("memory");
        let mut conn = driver.connect(&target()).await.unwrap();
        let xid = Xid::new(1, b"g1".to_vec(), b"b1".to_vec());
        conn.xa_start(&xid, StartFlag::NoFlags).await.unwrap();
        conn.execute("insert x", &[], 1).await.unwrap();
        conn.xa_end(&xid, EndFlag::Success).await.unwrap();
        assert_eq!(conn.xa_prepare(&xid).await.unwrap(), XaVote::Ok);
        assert_eq!(conn.xa_recover().await.unwrap(), vec![xid.clone()]);
        conn.xa_commit(&xid, false).await.unwrap();
        assert_eq!(driver.committed(), vec!["insert x".to_string()]);
        assert!(driver.prepared().is_empty());
    }

    #[tokio::test]
    async fn test_xa_prepare_without_writes_is_read_only() {
        let driver = MemoryDriver::new("memory");
        let mut conn = driver.connect(&target()).await.unwrap();
        let xid = Xid::new(1, b"g2".to_vec(), b"b1".to_vec());
        conn.xa_start(&xid, StartFlag::NoFlags).await.unwrap();
        conn.xa_end(&xid, EndFlag::Success).await.unwrap();
        assert_eq!(conn.xa_prepare(&xid).await.unwrap(), XaVote::ReadOnly);
    }
}
