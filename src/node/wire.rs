//! Messages exchanged between the client router and a node
//!
//! One JSON document per line in each direction. Every request carries the
//! calling client's id and its current view of cluster health.

use serde::{Deserialize, Serialize};

use crate::backend::{IsolationLevel, RowBlock, Value};
use crate::error::{ProxyError, TransportError};
use crate::metrics::MetricsSnapshot;
use crate::session::{SessionSnapshot, StatementResult};
use crate::types::{ClientId, ConnectionHandle, CursorId, SessionId};
use crate::xa::{EndFlag, StartFlag, XaVote, Xid};

/// Operations a node serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeRequest {
    /// Health probe; never touches a target
    Ping,
    OpenSession {
        #[serde(default = "default_datasource")]
        datasource: String,
        /// Backend connection string; empty uses the datasource's
        #[serde(default)]
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default)]
        xa: bool,
    },
    BindConnection {
        session: SessionId,
    },
    Execute {
        session: SessionId,
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
        fetch_size: usize,
    },
    Fetch {
        session: SessionId,
        cursor: CursorId,
        max_rows: usize,
    },
    CloseCursor {
        session: SessionId,
        cursor: CursorId,
    },
    Begin {
        session: SessionId,
    },
    Commit {
        session: SessionId,
    },
    Rollback {
        session: SessionId,
    },
    SetIsolation {
        session: SessionId,
        level: IsolationLevel,
    },
    Cancel {
        session: SessionId,
    },
    CloseSession {
        session: SessionId,
    },
    XaStart {
        session: SessionId,
        xid: Xid,
        flag: StartFlag,
    },
    XaEnd {
        session: SessionId,
        xid: Xid,
        flag: EndFlag,
    },
    XaPrepare {
        session: SessionId,
        xid: Xid,
    },
    XaCommit {
        session: SessionId,
        xid: Xid,
        one_phase: bool,
    },
    XaRollback {
        session: SessionId,
        xid: Xid,
    },
    XaRecover {
        session: SessionId,
    },
    XaForget {
        session: SessionId,
        xid: Xid,
    },
    XaSetTimeout {
        session: SessionId,
        seconds: u64,
    },
    XaGetTimeout {
        session: SessionId,
    },
    Inspect {
        session: SessionId,
    },
    Metrics,
}

fn default_datasource() -> String {
    crate::types::DatasourceName::DEFAULT.to_string()
}

impl NodeRequest {
    /// Session the request addresses, if any
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Ping | Self::OpenSession { .. } | Self::Metrics => None,
            Self::BindConnection { session }
            | Self::Execute { session, .. }
            | Self::Fetch { session, .. }
            | Self::CloseCursor { session, .. }
            | Self::Begin { session }
            | Self::Commit { session }
            | Self::Rollback { session }
            | Self::SetIsolation { session, .. }
            | Self::Cancel { session }
            | Self::CloseSession { session }
            | Self::XaStart { session, .. }
            | Self::XaEnd { session, .. }
            | Self::XaPrepare { session, .. }
            | Self::XaCommit { session, .. }
            | Self::XaRollback { session, .. }
            | Self::XaRecover { session }
            | Self::XaForget { session, .. }
            | Self::XaSetTimeout { session, .. }
            | Self::XaGetTimeout { session }
            | Self::Inspect { session } => Some(*session),
        }
    }

    /// Short operation name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::OpenSession { .. } => "open_session",
            Self::BindConnection { .. } => "bind_connection",
            Self::Execute { .. } => "execute",
            Self::Fetch { .. } => "fetch",
            Self::CloseCursor { .. } => "close_cursor",
            Self::Begin { .. } => "begin",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
            Self::SetIsolation { .. } => "set_isolation",
            Self::Cancel { .. } => "cancel",
            Self::CloseSession { .. } => "close_session",
            Self::XaStart { .. } => "xa_start",
            Self::XaEnd { .. } => "xa_end",
            Self::XaPrepare { .. } => "xa_prepare",
            Self::XaCommit { .. } => "xa_commit",
            Self::XaRollback { .. } => "xa_rollback",
            Self::XaRecover { .. } => "xa_recover",
            Self::XaForget { .. } => "xa_forget",
            Self::XaSetTimeout { .. } => "xa_set_timeout",
            Self::XaGetTimeout { .. } => "xa_get_timeout",
            Self::Inspect { .. } => "inspect",
            Self::Metrics => "metrics",
        }
    }
}

/// A request with its routing context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlates the response on a shared stream
    pub id: u64,
    pub client: ClientId,
    /// `host:port(UP);host:port(DOWN)` as seen by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_health: Option<String>,
    #[serde(flatten)]
    pub request: NodeRequest,
}

/// Replies to [`NodeRequest`]s
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum NodeResponse {
    Pong { address: String, sessions: usize },
    SessionOpened { session: SessionId, target: String },
    Connection { handle: ConnectionHandle },
    Statement(StatementResult),
    Rows(RowBlock),
    Done,
    Cancelled { was_running: bool },
    Vote(XaVote),
    Xids(Vec<Xid>),
    Timeout { seconds: u64 },
    Session(SessionSnapshot),
    Metrics(MetricsSnapshot),
    Error(ProxyError),
}

impl NodeResponse {
    #[must_use]
    pub fn from_result<T>(result: Result<T, ProxyError>, ok: impl FnOnce(T) -> Self) -> Self {
        match result {
            Ok(value) => ok(value),
            Err(e) => Self::Error(e),
        }
    }

    /// Turn an error response back into `Err`
    ///
    /// # Errors
    ///
    /// The node's error, unchanged.
    pub fn into_result(self) -> Result<Self, ProxyError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub response: NodeResponse,
}

/// Encode one message as a JSON line
///
/// # Errors
///
/// `Protocol` if the message cannot be serialized.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, TransportError> {
    let mut line =
        serde_json::to_vec(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one JSON line
///
/// # Errors
///
/// `Protocol` for malformed input.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, TransportError> {
    serde_json::from_str(line.trim_end()).map_err(|e| TransportError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_session_defaults_datasource() {
        let envelope: RequestEnvelope = decode_line(&format!(
            r#"{{"id":7,"client":"{}","op":"open_session","url":"mem://x"}}"#,
            ClientId::new()
        ))
        .unwrap();
        assert_eq!(envelope.id, 7);
        assert!(envelope.cluster_health.is_none());
        match envelope.request {
            NodeRequest::OpenSession {
                datasource, xa, ..
            } => {
                assert_eq!(datasource, "default");
                assert!(!xa);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_request_line_shape() {
        let envelope = RequestEnvelope {
            id: 1,
            client: ClientId::new(),
            cluster_health: Some("a:1(UP)".to_string()),
            request: NodeRequest::Ping,
        };
        let line = encode_line(&envelope).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let text = String::from_utf8(line).unwrap();
        assert!(text.contains(r#""op":"ping""#));
        let back: RequestEnvelope = decode_line(&text).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_error_response_keeps_type() {
        let response = ResponseEnvelope {
            id: 3,
            response: NodeResponse::Error(ProxyError::PoolExhaustedTimeout {
                target: "orders".into(),
                elapsed_ms: 10_000,
                max_size: 5,
            }),
        };
        let text = String::from_utf8(encode_line(&response).unwrap()).unwrap();
        let back: ResponseEnvelope = decode_line(&text).unwrap();
        let err = back.response.into_result().unwrap_err();
        assert!(err.is_pool_timeout());
    }

    #[test]
    fn test_malformed_line_is_protocol_error() {
        let err = decode_line::<RequestEnvelope>("{not json").unwrap_err();
        assert!(!err.is_connection_level());
    }

    #[test]
    fn test_request_session_accessor() {
        let session = SessionId::new();
        assert_eq!(NodeRequest::Begin { session }.session(), Some(session));
        assert_eq!(NodeRequest::Ping.session(), None);
        assert_eq!(NodeRequest::Metrics.name(), "metrics");
    }
}
