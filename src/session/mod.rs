//! Client sessions on a node
//!
//! A session is the server-side half of one logical client connection. It
//! binds a backend connection only while one is needed: for a single
//! auto-commit statement, for the lifetime of an explicit transaction, or
//! until every cursor it opened is consumed or closed.

mod manager;
mod reaper;
mod state;


pub use manager::SessionManager;
pub use reaper::spawn_reaper;
pub use state::SessionSnapshot;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{RowBlock, Value};
use crate::types::{ConnectionHandle, CursorId};

/// Timeouts applied by the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub statement_timeout: Duration,
    /// Sessions idle this long are treated as leaked
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1800),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Result of one executed statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub update_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_keys: Vec<Value>,
    /// Open cursor when the first block did not exhaust the result
    pub cursor: Option<CursorId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: RowBlock,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Backend connection that ran the statement
    pub connection: ConnectionHandle,
}
