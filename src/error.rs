//! Error types for the proxy core
//!
//! `ProxyError` is what callers see. It crosses the wire unchanged so a client
//! gets the same typed error the node produced, with enough context (target,
//! elapsed time, attempt count) to diagnose without server-side logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// X/Open XA error codes surfaced by the XA registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaErrorCode {
    /// Resource manager error
    RmErr,
    /// Unknown xid
    Nota,
    /// Invalid arguments
    Inval,
    /// Call made in the wrong state
    Proto,
    /// Xid already exists
    DupId,
}

impl XaErrorCode {
    /// Numeric X/Open XA return code
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::RmErr => -3,
            Self::Nota => -4,
            Self::Inval => -5,
            Self::Proto => -6,
            Self::DupId => -8,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RmErr => "XAER_RMERR",
            Self::Nota => "XAER_NOTA",
            Self::Inval => "XAER_INVAL",
            Self::Proto => "XAER_PROTO",
            Self::DupId => "XAER_DUPID",
        }
    }
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Errors returned by the proxy core to its callers
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ProxyError {
    /// Connect or validation failure against the backend; counts toward the breaker
    #[error(
        "backend '{target}' unavailable after {attempts} attempt(s) in {elapsed_ms}ms: {reason}"
    )]
    TransientBackend {
        target: String,
        attempts: u32,
        elapsed_ms: u64,
        reason: String,
    },

    /// Acquisition deadline exceeded; never retried by the pool itself
    #[error("pool '{target}' exhausted: no connection within {elapsed_ms}ms (max size {max_size})")]
    PoolExhaustedTimeout {
        target: String,
        elapsed_ms: u64,
        max_size: usize,
    },

    /// Breaker rejected the acquisition without touching the backend
    #[error(
        "circuit open for '{target}' after {failures} consecutive failure(s), retry in {retry_in_ms}ms"
    )]
    CircuitOpen {
        target: String,
        failures: u32,
        retry_in_ms: u64,
    },

    /// RPC-level failure between client and node
    #[error("transport failure on {node} after {attempts} attempt(s): {reason}")]
    TransportFailure {
        node: String,
        attempts: u32,
        reason: String,
    },

    /// Operation outside the required transaction context, or a transaction lost to failover
    #[error("transaction error on session {session}: {reason}")]
    TransactionState { session: String, reason: String },

    /// Indeterminate two-phase outcome, left for manual reconciliation
    #[error("heuristic outcome for xid {xid} on '{target}' during {phase}: {reason}")]
    HeuristicXaOutcome {
        xid: String,
        target: String,
        phase: String,
        reason: String,
    },

    #[error("{code}: {message}")]
    Xa { code: XaErrorCode, message: String },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("cursor {cursor} not found in session {session}")]
    CursorNotFound { session: String, cursor: String },

    /// The database rejected the statement
    #[error("backend '{target}' rejected statement: {message}")]
    Backend { target: String, message: String },

    #[error("pool '{0}' is shut down")]
    PoolClosed(String),

    #[error("no healthy node among {nodes} configured after {attempts} attempt(s)")]
    NoHealthyNodes { nodes: usize, attempts: u32 },

    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),

    #[error("unknown datasource '{0}'")]
    UnknownDatasource(String),

    #[error("unknown pool provider '{0}'")]
    UnknownProvider(String),

    #[error("operation cancelled on session {0}")]
    Cancelled(String),

    #[error("statement on session {session} exceeded {timeout_ms}ms")]
    StatementTimeout { session: String, timeout_ms: u64 },

    /// The node could not decode the request line
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl ProxyError {
    /// Shorthand for an XA protocol error
    pub fn xa(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self::Xa {
            code,
            message: message.into(),
        }
    }

    pub fn transaction(session: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::TransactionState {
            session: session.to_string(),
            reason: reason.into(),
        }
    }

    /// XA error code carried by this error, if any
    #[must_use]
    pub const fn xa_code(&self) -> Option<XaErrorCode> {
        match self {
            Self::Xa { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Failures that should count against a target's circuit breaker
    #[must_use]
    pub const fn is_transient_backend(&self) -> bool {
        matches!(self, Self::TransientBackend { .. })
    }

    #[must_use]
    pub const fn is_pool_timeout(&self) -> bool {
        matches!(self, Self::PoolExhaustedTimeout { .. })
    }

    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }

    /// Get the appropriate log level for this error
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        match self {
            // Expected under load or after explicit client actions
            Self::PoolExhaustedTimeout { .. }
            | Self::CircuitOpen { .. }
            | Self::Cancelled(_)
            | Self::SessionClosed(_) => tracing::Level::DEBUG,
            Self::HeuristicXaOutcome { .. } => tracing::Level::ERROR,
            Self::UnknownDatasource(_) | Self::UnknownProvider(_) => tracing::Level::ERROR,
            _ => tracing::Level::WARN,
        }
    }
}

/// Millisecond count for error context fields
#[inline]
pub(crate) fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Errors raised by backend drivers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Statement(String),

    /// The connection can no longer be used and must be discarded
    #[error("connection broken: {0}")]
    Broken(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is not supported by this driver")]
    Unsupported(&'static str),

    #[error("{code}: {message}")]
    Xa { code: XaErrorCode, message: String },
}

impl DriverError {
    /// Whether the physical connection is unusable after this error
    #[must_use]
    pub const fn is_connection_broken(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Broken(_))
    }
}

/// Errors raised by client-to-node transports
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Connection-level failures mark the node unhealthy; protocol errors do not
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::Unavailable(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::DeadlineExceeded(Duration::ZERO),
            _ => Self::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xa_code_values() {
        assert_eq!(XaErrorCode::Proto.code(), -6);
        assert_eq!(XaErrorCode::Nota.code(), -4);
        assert_eq!(XaErrorCode::DupId.code(), -8);
        assert_eq!(XaErrorCode::Proto.to_string(), "XAER_PROTO(-6)");
    }

    #[test]
    fn test_pool_timeout_message_has_context() {
        let err = ProxyError::PoolExhaustedTimeout {
            target: "orders".to_string(),
            elapsed_ms: 1000,
            max_size: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("1000ms"));
        assert!(msg.contains("max size 5"));
        assert!(err.is_pool_timeout());
        assert_eq!(err.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_transient_backend_context() {
        let err = ProxyError::TransientBackend {
            target: "orders".to_string(),
            attempts: 2,
            elapsed_ms: 15,
            reason: "refused".to_string(),
        };
        assert!(err.is_transient_backend());
        assert!(err.to_string().contains("2 attempt(s)"));
    }

    #[test]
    fn test_error_survives_json_roundtrip() {
        let err = ProxyError::xa(XaErrorCode::DupId, "branch exists");
        let wire = serde_json::to_string(&err).unwrap();
        let back: ProxyError = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.xa_code(), Some(XaErrorCode::DupId));
    }

    #[test]
    fn test_heuristic_logs_at_error() {
        let err = ProxyError::HeuristicXaOutcome {
            xid: "1:ab:01".to_string(),
            target: "orders".to_string(),
            phase: "prepare".to_string(),
            reason: "rm crashed".to_string(),
        };
        assert_eq!(err.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_driver_error_broken_classification() {
        assert!(DriverError::Broken("eof".into()).is_connection_broken());
        assert!(DriverError::Connect("refused".into()).is_connection_broken());
        assert!(!DriverError::Statement("syntax".into()).is_connection_broken());
    }

    #[test]
    fn test_transport_error_from_io() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TransportError = refused.into();
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert!(err.is_connection_level());
        assert!(!TransportError::Protocol("bad frame".into()).is_connection_level());
    }
}
