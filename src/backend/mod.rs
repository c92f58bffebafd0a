//! Backend driver seam
//!
//! The proxy core talks to real databases only through these traits. A driver
//! opens connections to one target; a connection runs statements, iterates
//! cursors and optionally takes part in XA branches.

mod memory;

pub use memory::MemoryDriver;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::DriverError;
use crate::types::ConnectionHandle;
use crate::xa::{EndFlag, StartFlag, XaVote, Xid};

/// A single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

pub type Row = Vec<Value>;

/// A block of rows from a cursor; `done` means the cursor is exhausted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBlock {
    pub rows: Vec<Row>,
    pub done: bool,
}

/// Driver-local cursor id, only meaningful on the connection that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendCursor(pub u64);

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Result of executing one statement on a backend connection
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Update {
        count: u64,
        generated_keys: Vec<Value>,
    },
    Rows {
        cursor: BackendCursor,
        columns: Vec<String>,
        first: RowBlock,
    },
}

/// Where a driver should connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// Name used in logs and errors
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BackendTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }
}

/// Best-effort cancellation of an in-flight statement
pub trait CancelHandle: Send + Sync + fmt::Debug {
    fn cancel(&self);
}

/// A physical connection to the underlying database
#[async_trait]
pub trait BackendConnection: Send + Sync + fmt::Debug {
    /// Identity of this physical connection
    fn handle(&self) -> ConnectionHandle;

    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        fetch_size: usize,
    ) -> Result<StatementOutcome, DriverError>;

    async fn fetch(&mut self, cursor: BackendCursor, max_rows: usize)
    -> Result<RowBlock, DriverError>;

    async fn close_cursor(&mut self, cursor: BackendCursor) -> Result<(), DriverError>;

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Validation used before a pooled connection is handed out
    async fn is_valid(&mut self) -> bool;

    /// Handle usable from another task while a statement is running
    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        None
    }

    /// Drain warnings raised by the last statement
    fn take_warnings(&mut self) -> Vec<String> {
        Vec::new()
    }

    async fn xa_start(&mut self, _xid: &Xid, _flag: StartFlag) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("XA"))
    }

    async fn xa_end(&mut self, _xid: &Xid, _flag: EndFlag) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("XA"))
    }

    async fn xa_prepare(&mut self, _xid: &Xid) -> Result<XaVote, DriverError> {
        Err(DriverError::Unsupported("XA"))
    }

    async fn xa_commit(&mut self, _xid: &Xid, _one_phase: bool) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("XA"))
    }

    async fn xa_rollback(&mut self, _xid: &Xid) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("XA"))
    }

    async fn xa_recover(&mut self) -> Result<Vec<Xid>, DriverError> {
        Err(DriverError::Unsupported("XA"))
    }

    async fn xa_forget(&mut self, _xid: &Xid) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("XA"))
    }
}

/// Opens connections to a database
#[async_trait]
pub trait BackendDriver: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn connect(
        &self,
        target: &BackendTarget,
    ) -> Result<Box<dyn BackendConnection>, DriverError>;
}

/// Drivers available to a node, keyed by the name used in configuration
#[derive(Debug, Default, Clone)]
pub struct DriverRegistry {
    drivers: Arc<DashMap<String, Arc<dyn BackendDriver>>>,
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process memory driver under `memory`
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(MemoryDriver::new("memory")));
        registry
    }

    /// Register a driver, replacing any previous driver with the same name
    pub fn register(&self, driver: Arc<dyn BackendDriver>) {
        tracing::debug!(driver = driver.name(), "Registered backend driver");
        self.drivers.insert(driver.name().to_string(), driver);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendDriver>> {
        self.drivers.get(name).map(|d| d.value().clone())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_has_memory_driver() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.get("memory").is_some());
        assert!(registry.get("postgres").is_none());
        assert_eq!(registry.names(), vec!["memory".to_string()]);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(MemoryDriver::new("memory")));
        registry.register(Arc::new(MemoryDriver::new("memory")));
        assert_eq!(registry.names().len(), 1);
    }

    #[test]
    fn test_default_isolation_is_read_committed() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}
