//! Client-side multinode router
//!
//! Picks a node for each new session, keeps every later request of that
//! session on the same node, and handles node failures:
//!
//! - An idle session (no transaction, no open cursor) is re-opened on another
//!   healthy node and the request is replayed.
//! - A session in a transaction or with an open cursor fails with
//!   `TransactionState` and is unbound; it is never moved to another node.
//!
//! Unhealthy nodes are probed with `Ping` on a doubling backoff and rejoin
//! selection once a probe succeeds. Session counts are local to this client.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{EndpointUrl, NodeState, Transport};
use crate::backend::{IsolationLevel, RowBlock, Value};
use crate::config::ClientConfig;
use crate::error::{ProxyError, TransportError};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::node::{NodeRequest, NodeResponse, RequestEnvelope};
use crate::session::{SessionSnapshot, StatementResult};
use crate::types::{ClientId, CursorId, NodeId, SessionId};
use crate::xa::{EndFlag, StartFlag, XaVote, Xid};

/// Where a logical session lives
#[derive(Debug, Clone)]
struct Binding {
    node: NodeId,
    remote: SessionId,
    xa: bool,
    in_transaction: bool,
    xa_branch: bool,
    cursors: HashSet<CursorId>,
    /// Session settings replayed on a new node after failover
    isolation: Option<IsolationLevel>,
    xa_timeout: Option<u64>,
}

impl Binding {
    fn new(node: NodeId, remote: SessionId, xa: bool) -> Self {
        Self {
            node,
            remote,
            xa,
            in_transaction: false,
            xa_branch: false,
            cursors: HashSet::new(),
            isolation: None,
            xa_timeout: None,
        }
    }

    /// State on the node that a fresh session elsewhere would not have
    fn is_pinned(&self) -> bool {
        self.in_transaction || self.xa_branch || !self.cursors.is_empty()
    }
}

/// Routes sessions across the nodes of one endpoint URL
#[derive(Debug)]
pub struct MultinodeRouter {
    client: ClientId,
    url: EndpointUrl,
    config: ClientConfig,
    nodes: Vec<NodeState>,
    transport: Arc<dyn Transport>,
    sessions: DashMap<SessionId, Binding>,
    user: Option<String>,
    password: Option<String>,
    next_request: AtomicU64,
    round_robin: AtomicUsize,
    metrics: MetricsCollector,
}

impl MultinodeRouter {
    /// Router for `url` (`jdbc:ojp[host:port,...]_<backend url>`)
    ///
    /// # Errors
    ///
    /// `InvalidEndpoint` if the URL does not parse.
    pub fn new(
        url: &str,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ProxyError> {
        let url = EndpointUrl::parse(url)?;
        let nodes = url
            .endpoints()
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                NodeState::new(
                    NodeId::from_index(index),
                    endpoint.clone(),
                    config.health_check_threshold,
                )
            })
            .collect();
        info!(
            endpoints = %url,
            nodes = url.endpoints().len(),
            "Multinode router configured"
        );
        Ok(Self {
            client: ClientId::new(),
            url,
            config,
            nodes,
            transport,
            sessions: DashMap::new(),
            user: None,
            password: None,
            next_request: AtomicU64::new(1),
            round_robin: AtomicUsize::new(0),
            metrics: MetricsCollector::new(),
        })
    }

    #[must_use]
    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeState] {
        &self.nodes
    }

    #[must_use]
    pub fn url(&self) -> &EndpointUrl {
        &self.url
    }

    /// Open logical sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Node a session is bound to
    #[must_use]
    pub fn node_of(&self, id: SessionId) -> Option<NodeId> {
        self.sessions.get(&id).map(|b| b.node)
    }

    /// This client's view of the cluster, relayed with every request
    #[must_use]
    pub fn cluster_health(&self) -> String {
        self.nodes
            .iter()
            .map(NodeState::health_entry)
            .collect::<Vec<_>>()
            .join(";")
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        for node in &self.nodes {
            self.metrics.set_node_sessions(node.address(), node.sessions());
        }
        self.metrics.snapshot()
    }

    fn node(&self, id: NodeId) -> &NodeState {
        &self.nodes[id.as_index()]
    }

    fn envelope(&self, request: NodeRequest) -> RequestEnvelope {
        RequestEnvelope {
            id: self.next_request.fetch_add(1, Ordering::Relaxed),
            client: self.client,
            cluster_health: Some(self.cluster_health()),
            request,
        }
    }

    /// Send to one node; transport failures mark it unhealthy
    async fn send(&self, node: &NodeState, request: NodeRequest) -> Result<NodeResponse, TransportError> {
        let result = match self.transport.send(node.endpoint(), self.envelope(request)).await {
            // A node refusing work while it shuts down counts as unreachable
            Ok(NodeResponse::Error(ProxyError::TransportFailure { reason, .. })) => {
                Err(TransportError::Unavailable(reason))
            }
            other => other,
        };
        if let Err(e) = &result {
            self.metrics.record_client_failover();
            if node.mark_unhealthy() {
                warn!(node = %node.address(), error = %e, "Node marked unhealthy");
            }
        }
        result
    }

    /// Healthy node for a new session
    fn select_node(&self) -> Option<&NodeState> {
        let healthy: Vec<&NodeState> = self.nodes.iter().filter(|n| n.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }
        if self.config.load_aware_selection {
            healthy.into_iter().min_by_key(|n| n.sessions())
        } else {
            let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % healthy.len();
            Some(healthy[index])
        }
    }

    /// One pass over the healthy nodes; probes the rest if none is left
    async fn open_remote(&self, xa: bool) -> Result<(NodeId, SessionId), ProxyError> {
        let mut probed = false;
        loop {
            let Some(node) = self.select_node() else {
                if probed || self.probe_unhealthy().await == 0 {
                    return Err(ProxyError::NoHealthyNodes {
                        nodes: self.nodes.len(),
                        attempts: 1,
                    });
                }
                probed = true;
                continue;
            };

            let request = NodeRequest::OpenSession {
                datasource: node.endpoint().datasource.clone(),
                url: self.url.backend_url().to_string(),
                user: self.user.clone(),
                password: self.password.clone(),
                xa,
            };
            let Ok(response) = self.send(node, request).await else {
                continue;
            };
            return match response.into_result()? {
                NodeResponse::SessionOpened { session, target } => {
                    node.session_opened();
                    debug!(node = %node.address(), %session, target, "Session opened");
                    Ok((node.id(), session))
                }
                other => Err(unexpected(node, "open_session", &other)),
            };
        }
    }

    async fn open(&self, xa: bool) -> Result<SessionId, ProxyError> {
        let mut attempts = 0u32;
        loop {
            match self.open_remote(xa).await {
                Ok((node, remote)) => {
                    let id = SessionId::new();
                    self.sessions.insert(id, Binding::new(node, remote, xa));
                    return Ok(id);
                }
                Err(ProxyError::NoHealthyNodes { .. }) => {}
                Err(e) => return Err(e),
            }

            attempts += 1;
            if !self.config.allows_attempt(attempts) {
                return Err(ProxyError::NoHealthyNodes {
                    nodes: self.nodes.len(),
                    attempts,
                });
            }
            self.metrics.record_client_retry();
            debug!(
                attempts,
                delay_ms = crate::error::millis(self.config.retry_delay),
                "No healthy node, retrying session open"
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Open a session on the least loaded healthy node
    ///
    /// # Errors
    ///
    /// `NoHealthyNodes` once the retry policy is exhausted, or the node's
    /// error (unknown datasource, pool failures).
    pub async fn open_session(&self) -> Result<SessionId, ProxyError> {
        self.open(false).await
    }

    /// Open a session for XA branches
    ///
    /// # Errors
    ///
    /// As [`Self::open_session`], plus `XAER_RMERR` if the node has no XA pool.
    pub async fn open_xa_session(&self) -> Result<SessionId, ProxyError> {
        self.open(true).await
    }

    fn binding(&self, id: SessionId) -> Result<Binding, ProxyError> {
        self.sessions
            .get(&id)
            .map(|b| b.clone())
            .ok_or_else(|| ProxyError::SessionNotFound(id.to_string()))
    }

    fn unbind(&self, id: SessionId) -> Option<Binding> {
        let (_, binding) = self.sessions.remove(&id)?;
        self.node(binding.node).session_closed();
        Some(binding)
    }

    fn update(&self, id: SessionId, apply: impl FnOnce(&mut Binding)) {
        if let Some(mut binding) = self.sessions.get_mut(&id) {
            apply(&mut binding);
        }
    }

    /// Send a session request, failing over when the session allows it
    async fn call(
        &self,
        id: SessionId,
        build: impl Fn(SessionId) -> NodeRequest,
    ) -> Result<NodeResponse, ProxyError> {
        let mut replays = 0usize;
        loop {
            let binding = self.binding(id)?;
            let node = self.node(binding.node);
            let error = match self.send(node, build(binding.remote)).await {
                Ok(response) => return response.into_result(),
                Err(e) => e,
            };

            if binding.is_pinned() {
                self.unbind(id);
                warn!(
                    session = %id,
                    node = %node.address(),
                    "Node lost mid-transaction, session aborted"
                );
                return Err(ProxyError::transaction(
                    id,
                    format!("transaction aborted: node {} unreachable: {error}", node.address()),
                ));
            }
            if replays >= self.nodes.len() {
                return Err(ProxyError::TransportFailure {
                    node: node.address().to_string(),
                    attempts: u32::try_from(replays + 1).unwrap_or(u32::MAX),
                    reason: error.to_string(),
                });
            }

            replays += 1;
            self.metrics.record_client_retry();
            let (new_node, remote) = self.open_remote(binding.xa).await?;
            if !self.restore_settings(new_node, remote, &binding).await? {
                self.node(new_node).session_closed();
                continue;
            }
            node.session_closed();
            self.update(id, |b| {
                b.node = new_node;
                b.remote = remote;
            });
            info!(
                session = %id,
                from = %node.address(),
                to = %self.node(new_node).address(),
                "Idle session moved to another node"
            );
        }
    }

    /// Apply the session's settings to its replacement remote session
    ///
    /// Returns `false` when the new node became unreachable meanwhile.
    async fn restore_settings(
        &self,
        node: NodeId,
        remote: SessionId,
        binding: &Binding,
    ) -> Result<bool, ProxyError> {
        let node = self.node(node);
        let mut requests = Vec::new();
        if let Some(level) = binding.isolation {
            requests.push(NodeRequest::SetIsolation {
                session: remote,
                level,
            });
        }
        if let Some(seconds) = binding.xa_timeout {
            requests.push(NodeRequest::XaSetTimeout {
                session: remote,
                seconds,
            });
        }
        for request in requests {
            match self.send(node, request).await {
                Ok(response) => {
                    response.into_result()?;
                }
                Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }

    /// # Errors
    ///
    /// The node's error, `TransactionState` if the node was lost while the
    /// session held a transaction or cursor, or `NoHealthyNodes`.
    pub async fn execute(
        &self,
        id: SessionId,
        sql: &str,
        params: &[Value],
        fetch_size: usize,
    ) -> Result<StatementResult, ProxyError> {
        let response = self
            .call(id, |session| NodeRequest::Execute {
                session,
                sql: sql.to_string(),
                params: params.to_vec(),
                fetch_size,
            })
            .await?;
        match response {
            NodeResponse::Statement(result) => {
                if let Some(cursor) = result.cursor {
                    self.update(id, |b| {
                        b.cursors.insert(cursor);
                    });
                }
                Ok(result)
            }
            other => Err(self.unexpected_for(id, "execute", &other)),
        }
    }

    /// # Errors
    ///
    /// `CursorNotFound` or the node's error.
    pub async fn fetch(
        &self,
        id: SessionId,
        cursor: CursorId,
        max_rows: usize,
    ) -> Result<RowBlock, ProxyError> {
        let response = self
            .call(id, |session| NodeRequest::Fetch {
                session,
                cursor,
                max_rows,
            })
            .await?;
        match response {
            NodeResponse::Rows(block) => {
                if block.done {
                    self.update(id, |b| {
                        b.cursors.remove(&cursor);
                    });
                }
                Ok(block)
            }
            other => Err(self.unexpected_for(id, "fetch", &other)),
        }
    }

    /// # Errors
    ///
    /// The node's error.
    pub async fn close_cursor(&self, id: SessionId, cursor: CursorId) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::CloseCursor { session, cursor })
            .await?;
        self.update(id, |b| {
            b.cursors.remove(&cursor);
        });
        Ok(())
    }

    /// # Errors
    ///
    /// `TransactionState` on an XA session or the node's error.
    pub async fn begin(&self, id: SessionId) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::Begin { session }).await?;
        self.update(id, |b| b.in_transaction = true);
        Ok(())
    }

    /// # Errors
    ///
    /// `TransactionState` without an open transaction, or the node's error.
    pub async fn commit(&self, id: SessionId) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::Commit { session }).await?;
        self.update(id, |b| b.in_transaction = false);
        Ok(())
    }

    /// # Errors
    ///
    /// `TransactionState` without an open transaction, or the node's error.
    pub async fn rollback(&self, id: SessionId) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::Rollback { session }).await?;
        self.update(id, |b| b.in_transaction = false);
        Ok(())
    }

    /// # Errors
    ///
    /// `TransactionState` inside an open transaction.
    pub async fn set_isolation(&self, id: SessionId, level: IsolationLevel) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::SetIsolation { session, level })
            .await?;
        self.update(id, |b| b.isolation = Some(level));
        Ok(())
    }

    /// Best-effort cancel of the session's running statement
    ///
    /// Never fails over; an unreachable node reports nothing cancelled.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`.
    pub async fn cancel(&self, id: SessionId) -> Result<bool, ProxyError> {
        let binding = self.binding(id)?;
        let node = self.node(binding.node);
        match self
            .send(node, NodeRequest::Cancel {
                session: binding.remote,
            })
            .await
        {
            Ok(NodeResponse::Cancelled { was_running }) => Ok(was_running),
            Ok(NodeResponse::Error(e)) => Err(e),
            Ok(other) => Err(unexpected(node, "cancel", &other)),
            Err(_) => Ok(false),
        }
    }

    /// Close a session; closing twice is a no-op
    pub async fn close_session(&self, id: SessionId) {
        let Some(binding) = self.unbind(id) else {
            return;
        };
        let node = self.node(binding.node);
        if !node.is_healthy() {
            return;
        }
        match self
            .send(node, NodeRequest::CloseSession {
                session: binding.remote,
            })
            .await
        {
            Ok(_) => debug!(session = %id, node = %node.address(), "Session closed"),
            Err(e) => debug!(session = %id, error = %e, "Close not delivered"),
        }
    }

    /// Close every open session
    pub async fn close(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|b| *b.key()).collect();
        for id in ids {
            self.close_session(id).await;
        }
    }

    /// Node-side view of the session
    ///
    /// # Errors
    ///
    /// `SessionNotFound` or a transport failure.
    pub async fn inspect(&self, id: SessionId) -> Result<SessionSnapshot, ProxyError> {
        match self.call(id, |session| NodeRequest::Inspect { session }).await? {
            NodeResponse::Session(snapshot) => Ok(snapshot),
            other => Err(self.unexpected_for(id, "inspect", &other)),
        }
    }

    /// # Errors
    ///
    /// XA protocol errors from the node.
    pub async fn xa_start(&self, id: SessionId, xid: &Xid, flag: StartFlag) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::XaStart {
            session,
            xid: xid.clone(),
            flag,
        })
        .await?;
        self.update(id, |b| b.xa_branch = true);
        Ok(())
    }

    /// # Errors
    ///
    /// XA protocol errors from the node.
    pub async fn xa_end(&self, id: SessionId, xid: &Xid, flag: EndFlag) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::XaEnd {
            session,
            xid: xid.clone(),
            flag,
        })
        .await
        .map(|_| ())
    }

    /// # Errors
    ///
    /// XA protocol errors or `HeuristicXaOutcome`.
    pub async fn xa_prepare(&self, id: SessionId, xid: &Xid) -> Result<XaVote, ProxyError> {
        let response = self
            .call(id, |session| NodeRequest::XaPrepare {
                session,
                xid: xid.clone(),
            })
            .await?;
        match response {
            NodeResponse::Vote(vote) => {
                if vote == XaVote::ReadOnly {
                    self.update(id, |b| b.xa_branch = false);
                }
                Ok(vote)
            }
            other => Err(self.unexpected_for(id, "xa_prepare", &other)),
        }
    }

    /// # Errors
    ///
    /// XA protocol errors from the node.
    pub async fn xa_commit(&self, id: SessionId, xid: &Xid, one_phase: bool) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::XaCommit {
            session,
            xid: xid.clone(),
            one_phase,
        })
        .await?;
        self.update(id, |b| b.xa_branch = false);
        Ok(())
    }

    /// # Errors
    ///
    /// XA protocol errors from the node.
    pub async fn xa_rollback(&self, id: SessionId, xid: &Xid) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::XaRollback {
            session,
            xid: xid.clone(),
        })
        .await?;
        self.update(id, |b| b.xa_branch = false);
        Ok(())
    }

    /// # Errors
    ///
    /// XA protocol errors from the node.
    pub async fn xa_recover(&self, id: SessionId) -> Result<Vec<Xid>, ProxyError> {
        match self.call(id, |session| NodeRequest::XaRecover { session }).await? {
            NodeResponse::Xids(xids) => Ok(xids),
            other => Err(self.unexpected_for(id, "xa_recover", &other)),
        }
    }

    /// # Errors
    ///
    /// `XAER_NOTA` unless the branch is indeterminate.
    pub async fn xa_forget(&self, id: SessionId, xid: &Xid) -> Result<(), ProxyError> {
        self.call(id, |session| NodeRequest::XaForget {
            session,
            xid: xid.clone(),
        })
        .await
        .map(|_| ())
    }

    /// # Errors
    ///
    /// XA protocol errors from the node.
    pub async fn xa_set_transaction_timeout(
        &self,
        id: SessionId,
        timeout: Duration,
    ) -> Result<(), ProxyError> {
        let seconds = timeout.as_secs();
        self.call(id, |session| NodeRequest::XaSetTimeout { session, seconds })
            .await?;
        self.update(id, |b| b.xa_timeout = Some(seconds));
        Ok(())
    }

    /// # Errors
    ///
    /// XA protocol errors from the node.
    pub async fn xa_transaction_timeout(&self, id: SessionId) -> Result<Duration, ProxyError> {
        match self.call(id, |session| NodeRequest::XaGetTimeout { session }).await? {
            NodeResponse::Timeout { seconds } => Ok(Duration::from_secs(seconds)),
            other => Err(self.unexpected_for(id, "xa_get_timeout", &other)),
        }
    }

    async fn probe(&self, node: &NodeState) -> bool {
        let ping = self.transport.send(node.endpoint(), self.envelope(NodeRequest::Ping));
        match tokio::time::timeout(self.config.health_check_timeout, ping).await {
            Ok(Ok(NodeResponse::Pong { .. })) => {
                node.mark_healthy(self.config.health_check_threshold);
                info!(node = %node.address(), "Node recovered");
                true
            }
            _ => {
                node.probe_failed(self.config.max_probe_backoff);
                debug!(
                    node = %node.address(),
                    next_probe_ms = crate::error::millis(node.probe_delay()),
                    "Probe failed"
                );
                false
            }
        }
    }

    /// Probe every unhealthy node now; returns how many recovered
    pub async fn probe_unhealthy(&self) -> usize {
        let mut recovered = 0;
        for node in self.nodes.iter().filter(|n| !n.is_healthy()) {
            if self.probe(node).await {
                recovered += 1;
            }
        }
        recovered
    }

    /// Probe unhealthy nodes whose backoff has elapsed
    pub async fn probe_due(&self) -> usize {
        let now = Instant::now();
        let mut recovered = 0;
        for node in self.nodes.iter().filter(|n| n.probe_due(now)) {
            if self.probe(node).await {
                recovered += 1;
            }
        }
        recovered
    }

    /// Background recovery probing every health-check interval
    pub fn spawn_recovery(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let interval = router.config.health_check_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Recovery task shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {
                        router.probe_due().await;
                    }
                }
            }
        })
    }

    fn unexpected_for(&self, id: SessionId, op: &str, response: &NodeResponse) -> ProxyError {
        match self.binding(id) {
            Ok(binding) => unexpected(self.node(binding.node), op, response),
            Err(e) => e,
        }
    }
}

fn unexpected(node: &NodeState, op: &str, response: &NodeResponse) -> ProxyError {
    ProxyError::TransportFailure {
        node: node.address().to_string(),
        attempts: 1,
        reason: format!("unexpected reply to {op}: {response:?}"),
    }
}
