//! Proxy node
//!
//! A node owns the backend targets, the session registry and the cluster
//! health tracker. Every request is answered by [`ProxyNode::handle`], whether
//! it arrived over TCP or through the in-process transport.

mod server;
mod target;
mod wire;

pub use server::NodeServer;
pub use target::{TargetRuntime, TargetSettings, XaPoolSettings};
pub use wire::{
    NodeRequest, NodeResponse, RequestEnvelope, ResponseEnvelope, decode_line, encode_line,
};

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendTarget, DriverRegistry};
use crate::capacity::{ClusterHealth, ClusterHealthTracker};
use crate::config::{Config, DatasourceConfig};
use crate::error::ProxyError;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::pool::{PoolProviderRegistry, PoolSettings};
use crate::segregation::SegregationSettings;
use crate::session::{SessionManager, SessionSettings, spawn_reaper};
use crate::types::{ClientId, ConnHash, DatasourceName, SessionId};

/// Builder for [`ProxyNode`]
#[derive(Debug)]
pub struct NodeBuilder {
    config: Config,
    address: Option<String>,
    drivers: DriverRegistry,
    providers: PoolProviderRegistry,
    metrics: MetricsCollector,
}

impl NodeBuilder {
    /// Address clients list this node under; defaults to the advertised address
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    #[must_use]
    pub fn providers(mut self, providers: PoolProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<ProxyNode> {
        let session_settings = SessionSettings {
            statement_timeout: self.config.session.statement_timeout,
            idle_timeout: self.config.session.idle_timeout,
            reap_interval: self.config.session.reap_interval,
        };
        let (shutdown_tx, _) = broadcast::channel(1);
        let address = self
            .address
            .unwrap_or_else(|| self.config.node.advertised());
        Arc::new(ProxyNode {
            sessions: Arc::new(SessionManager::new(session_settings, self.metrics.clone())),
            address,
            config: self.config,
            drivers: self.drivers,
            providers: self.providers,
            targets: DashMap::new(),
            building: tokio::sync::Mutex::new(()),
            tracker: ClusterHealthTracker::new(),
            metrics: self.metrics,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }
}

/// One proxy server instance
#[derive(Debug)]
pub struct ProxyNode {
    address: String,
    config: Config,
    drivers: DriverRegistry,
    providers: PoolProviderRegistry,
    targets: DashMap<ConnHash, Arc<TargetRuntime>>,
    /// Serializes target construction so one hash gets one set of pools
    building: tokio::sync::Mutex<()>,
    tracker: ClusterHealthTracker,
    sessions: Arc<SessionManager>,
    metrics: MetricsCollector,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl ProxyNode {
    /// Node with the built-in drivers and pool providers
    #[must_use]
    pub fn builder(config: Config) -> NodeBuilder {
        NodeBuilder {
            config,
            address: None,
            drivers: DriverRegistry::with_builtin(),
            providers: PoolProviderRegistry::with_builtin(),
            metrics: MetricsCollector::new(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    #[must_use]
    pub fn target(&self, conn_hash: &ConnHash) -> Option<Arc<TargetRuntime>> {
        self.targets.get(conn_hash).map(|t| t.value().clone())
    }

    #[must_use]
    pub fn targets(&self) -> Vec<Arc<TargetRuntime>> {
        self.targets.iter().map(|t| t.value().clone()).collect()
    }

    /// Counters plus current pool gauges for every target
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut pools = Vec::new();
        for target in self.targets() {
            pools.push((target.name().to_string(), target.pool_status()));
            if let Some(xa) = target.xa_pool_status() {
                pools.push((format!("{}-xa", target.name()), xa));
            }
        }
        self.metrics.snapshot().with_pool_status(pools)
    }

    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start the idle-session reaper
    pub fn start_background_tasks(self: &Arc<Self>) {
        let settings = self.sessions.settings().clone();
        if spawn_reaper(
            self.sessions.clone(),
            settings.reap_interval,
            settings.idle_timeout,
            self.subscribe_shutdown(),
        )
        .is_some()
        {
            debug!(node = %self.address, "Background tasks started");
        }
    }

    fn target_settings(&self, datasource: &DatasourceConfig) -> TargetSettings {
        let pool = &self.config.pool;
        let xa = &self.config.xa;
        TargetSettings {
            provider: Some(pool.provider.clone()),
            pool: PoolSettings {
                max_size: datasource.max_size.unwrap_or(pool.max_size).get(),
                min_idle: datasource.min_idle.unwrap_or(pool.min_idle),
                acquire_timeout: datasource.acquire_timeout.unwrap_or(pool.acquire_timeout),
                idle_timeout: pool.idle_timeout,
                max_lifetime: pool.max_lifetime,
                maintenance_interval: pool.maintenance_interval,
            },
            segregation: SegregationSettings {
                enabled: self.config.segregation.enabled,
                slow_fraction: self.config.segregation.slow_fraction,
                slow_threshold: self.config.segregation.slow_threshold,
                borrow_window: self.config.segregation.borrow_window,
                refresh_interval: self.config.segregation.refresh_interval,
            },
            failure_threshold: self.config.circuit_breaker.failure_threshold.get(),
            cool_down: self.config.circuit_breaker.cool_down,
            xa: xa.enabled.then(|| XaPoolSettings {
                max_size: datasource.xa_max_size.unwrap_or(xa.max_size).get(),
                min_idle: datasource.xa_min_idle.unwrap_or(xa.min_idle),
            }),
            view_ttl: self.config.cluster.view_ttl,
        }
    }

    /// Find or build the target for a datasource and backend identity
    async fn resolve_target(
        &self,
        datasource: &str,
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
        report: Option<&str>,
    ) -> Result<Arc<TargetRuntime>, ProxyError> {
        let name = DatasourceName::new(datasource.to_string())
            .map_err(|_| ProxyError::UnknownDatasource(datasource.to_string()))?;
        let Some(ds) = self.config.datasources.get(&name) else {
            return Err(ProxyError::UnknownDatasource(datasource.to_string()));
        };
        let url = if url.is_empty() { ds.url.as_str() } else { url };
        let user = user.or(ds.username.as_deref());
        let conn_hash = ConnHash::compute(datasource, url, user);

        if let Some(target) = self.target(&conn_hash) {
            return Ok(target);
        }

        let _building = self.building.lock().await;
        if let Some(target) = self.target(&conn_hash) {
            return Ok(target);
        }

        let driver = self.drivers.get(&ds.driver).ok_or_else(|| ProxyError::Backend {
            target: datasource.to_string(),
            message: format!(
                "unknown driver '{}', available: {:?}",
                ds.driver,
                self.drivers.names()
            ),
        })?;
        let backend = BackendTarget::new(datasource, url).with_credentials(
            user.map(str::to_string),
            password.map(str::to_string).or_else(|| ds.password.clone()),
        );
        let health = report.map(ClusterHealth::parse).unwrap_or_default();
        let target = TargetRuntime::build(
            conn_hash.clone(),
            backend,
            driver,
            &self.providers,
            &self.target_settings(ds),
            &health,
            &self.address,
            self.metrics.clone(),
        )
        .map_err(|e| match e.downcast_ref::<ProxyError>() {
            Some(proxy) => proxy.clone(),
            None => ProxyError::Backend {
                target: datasource.to_string(),
                message: format!("{e:#}"),
            },
        })?;

        let target = Arc::new(target);
        self.targets.insert(conn_hash, target.clone());
        Ok(target)
    }

    /// Feed a client's relayed cluster health to the target's coordinator
    fn observe_health(&self, target: &TargetRuntime, client: ClientId, report: Option<&str>) {
        let Some(report) = report.filter(|r| !r.trim().is_empty()) else {
            return;
        };
        let coordinator = target.coordinator();
        let resized = if self.tracker.has_health_changed(target.conn_hash(), client, report) {
            coordinator.update_view(client, ClusterHealth::parse(report))
        } else {
            coordinator.touch(client, || ClusterHealth::parse(report))
        };
        for lapsed in coordinator.drain_expired() {
            self.tracker.forget(target.conn_hash(), lapsed);
        }
        if let Some(share) = resized {
            debug!(
                target_name = target.name(),
                healthy = share.healthy_nodes,
                max_size = share.max_size,
                "Applied relayed cluster health"
            );
        }
    }

    /// Stop counting `client`'s view once it has no sessions left on `target`
    fn release_client(&self, target: &TargetRuntime, client: ClientId) {
        if self.sessions.has_client_sessions(client, target.conn_hash()) {
            return;
        }
        if target.coordinator().forget_client(client) {
            debug!(target_name = target.name(), client = %client, "Client left target");
        }
        self.tracker.forget(target.conn_hash(), client);
    }

    #[must_use]
    pub fn tracker(&self) -> &ClusterHealthTracker {
        &self.tracker
    }

    /// Open a session for `client`
    ///
    /// # Errors
    ///
    /// `UnknownDatasource`, target construction failures, or `XAER_RMERR` for
    /// an XA session on a target without XA.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_session(
        &self,
        client: ClientId,
        report: Option<&str>,
        datasource: &str,
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
        xa: bool,
    ) -> Result<(SessionId, String), ProxyError> {
        let target = self
            .resolve_target(datasource, url, user, password, report)
            .await?;
        self.observe_health(&target, client, report);
        let name = target.name().to_string();
        let session = self.sessions.open_session(target, client, xa)?;
        Ok((session, name))
    }

    fn shutting_down_error(&self) -> ProxyError {
        ProxyError::TransportFailure {
            node: self.address.clone(),
            attempts: 1,
            reason: "node is shutting down".to_string(),
        }
    }

    /// Serve one request
    pub async fn handle(&self, envelope: RequestEnvelope) -> NodeResponse {
        let RequestEnvelope {
            client,
            cluster_health,
            request,
            ..
        } = envelope;
        let op = request.name();
        trace!(node = %self.address, client = %client, op, "Handling request");

        if self.is_shutting_down() && !matches!(request, NodeRequest::Ping) {
            return NodeResponse::Error(self.shutting_down_error());
        }
        if let Some(session) = request.session()
            && let Some(target) = self.sessions.target_of(session)
        {
            self.observe_health(&target, client, cluster_health.as_deref());
        }

        let response = self.dispatch(client, cluster_health.as_deref(), request).await;
        if let NodeResponse::Error(e) = &response {
            match e.log_level() {
                tracing::Level::ERROR => error!(node = %self.address, op, error = %e, "Request failed"),
                tracing::Level::WARN => warn!(node = %self.address, op, error = %e, "Request failed"),
                _ => debug!(node = %self.address, op, error = %e, "Request failed"),
            }
        }
        response
    }

    async fn dispatch(
        &self,
        client: ClientId,
        report: Option<&str>,
        request: NodeRequest,
    ) -> NodeResponse {
        let sessions = &self.sessions;
        match request {
            NodeRequest::Ping => NodeResponse::Pong {
                address: self.address.clone(),
                sessions: sessions.len(),
            },
            NodeRequest::OpenSession {
                datasource,
                url,
                user,
                password,
                xa,
            } => NodeResponse::from_result(
                self.open_session(
                    client,
                    report,
                    &datasource,
                    &url,
                    user.as_deref(),
                    password.as_deref(),
                    xa,
                )
                .await,
                |(session, target)| NodeResponse::SessionOpened { session, target },
            ),
            NodeRequest::BindConnection { session } => NodeResponse::from_result(
                sessions.bind_connection(session).await,
                |handle| NodeResponse::Connection { handle },
            ),
            NodeRequest::Execute {
                session,
                sql,
                params,
                fetch_size,
            } => NodeResponse::from_result(
                sessions.execute(session, &sql, &params, fetch_size).await,
                NodeResponse::Statement,
            ),
            NodeRequest::Fetch {
                session,
                cursor,
                max_rows,
            } => NodeResponse::from_result(
                sessions.fetch(session, cursor, max_rows).await,
                NodeResponse::Rows,
            ),
            NodeRequest::CloseCursor { session, cursor } => NodeResponse::from_result(
                sessions.close_cursor(session, cursor).await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::Begin { session } => {
                NodeResponse::from_result(sessions.begin_tx(session).await, |()| NodeResponse::Done)
            }
            NodeRequest::Commit { session } => {
                NodeResponse::from_result(sessions.commit(session).await, |()| NodeResponse::Done)
            }
            NodeRequest::Rollback { session } => {
                NodeResponse::from_result(sessions.rollback(session).await, |()| NodeResponse::Done)
            }
            NodeRequest::SetIsolation { session, level } => NodeResponse::from_result(
                sessions.set_isolation(session, level).await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::Cancel { session } => {
                NodeResponse::from_result(sessions.cancel(session), |was_running| {
                    NodeResponse::Cancelled { was_running }
                })
            }
            NodeRequest::CloseSession { session } => {
                let target = sessions.target_of(session);
                sessions.close_session(session).await;
                if let Some(target) = target {
                    self.release_client(&target, client);
                }
                NodeResponse::Done
            }
            NodeRequest::XaStart { session, xid, flag } => NodeResponse::from_result(
                sessions.xa_start(session, &xid, flag).await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::XaEnd { session, xid, flag } => NodeResponse::from_result(
                sessions.xa_end(session, &xid, flag).await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::XaPrepare { session, xid } => NodeResponse::from_result(
                sessions.xa_prepare(session, &xid).await,
                NodeResponse::Vote,
            ),
            NodeRequest::XaCommit {
                session,
                xid,
                one_phase,
            } => NodeResponse::from_result(
                sessions.xa_commit(session, &xid, one_phase).await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::XaRollback { session, xid } => NodeResponse::from_result(
                sessions.xa_rollback(session, &xid).await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::XaRecover { session } => {
                NodeResponse::from_result(sessions.xa_recover(session).await, NodeResponse::Xids)
            }
            NodeRequest::XaForget { session, xid } => NodeResponse::from_result(
                sessions.xa_forget(session, &xid).await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::XaSetTimeout { session, seconds } => NodeResponse::from_result(
                sessions
                    .xa_set_transaction_timeout(session, Duration::from_secs(seconds))
                    .await,
                |()| NodeResponse::Done,
            ),
            NodeRequest::XaGetTimeout { session } => NodeResponse::from_result(
                sessions.xa_transaction_timeout(session).await,
                |timeout| NodeResponse::Timeout {
                    seconds: timeout.as_secs(),
                },
            ),
            NodeRequest::Inspect { session } => match sessions.snapshot(session).await {
                Some(snapshot) => NodeResponse::Session(snapshot),
                None => NodeResponse::Error(ProxyError::SessionNotFound(session.to_string())),
            },
            NodeRequest::Metrics => NodeResponse::Metrics(self.metrics_snapshot()),
        }
    }

    /// Stop serving: close every session and shut down every pool
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.address, sessions = self.sessions.len(), "Shutting down proxy node");
        let _ = self.shutdown_tx.send(());
        self.sessions.close_all().await;
        for target in self.targets() {
            target.shutdown().await;
            self.tracker.remove_tracking(target.conn_hash());
        }
        info!(node = %self.address, "Proxy node stopped");
    }
}
