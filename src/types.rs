//! Core identifiers shared by the node and the client router
//!
//! Sessions, cursors and backend connections are all addressed through
//! opaque handles so state can be looked up across independent requests.

pub mod config;
pub mod validated;

pub use config::{
    MaxConnections, MaxErrors, Port, duration_millis_serde, duration_serde, option_duration_serde,
    option_millis_serde,
};
pub use validated::{DatasourceName, HostName, ValidationError};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for a client process (one per router instance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new unique client ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque session token handed to clients on "open session"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of an open result cursor within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorId(Uuid);

impl CursorId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CursorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of a node in the client's configured endpoint list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
#[display("Node({_0})")]
pub struct NodeId(usize);

impl NodeId {
    /// Create a node ID from its configured index
    #[must_use]
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    #[inline]
    pub fn as_index(&self) -> usize {
        self.0
    }
}


static NEXT_CONNECTION_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a physical backend connection
///
/// Used to assert that two statements ran on the same backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("conn#{_0}")]
#[serde(transparent)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    /// Allocate the next handle
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Identity of a backend target: datasource, connection string and user
///
/// Two sessions with the same hash share one pool on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnHash(String);

impl ConnHash {
    #[must_use]
    pub fn compute(datasource: &str, url: &str, user: Option<&str>) -> Self {
        let mut hasher = DefaultHasher::new();
        datasource.hash(&mut hasher);
        url.hash(&mut hasher);
        user.unwrap_or_default().hash(&mut hasher);
        Self(format!("{:016x}", hasher.finish()))
    }

    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
