//! Configuration type definitions
//!
//! Node configuration is read from TOML at startup. Pool and XA sizes are
//! totals for the whole cluster; each node applies its share.

use crate::types::{
    DatasourceName, MaxConnections, MaxErrors, Port, duration_serde, option_duration_serde,
    option_millis_serde,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main node configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub node: NodeConfig,
    /// Pool defaults applied to every datasource
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub segregation: SegregationConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub xa: XaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Backend targets by datasource name
    #[serde(default)]
    pub datasources: BTreeMap<DatasourceName, DatasourceConfig>,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Host/IP to bind to (default: 0.0.0.0)
    #[serde(default = "super::defaults::host")]
    pub host: String,
    /// Port to listen on (default: 1059)
    #[serde(default)]
    pub port: Port,
    /// `host:port` clients use for this node in their endpoint lists
    ///
    /// Used to find this node's rank in relayed cluster health.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_address: Option<String>,
    /// Number of worker threads (0 for CPU cores)
    #[serde(default)]
    pub threads: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: super::defaults::host(),
            port: Port::default(),
            advertised_address: None,
            threads: 0,
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address peers and clients know this node by
    #[must_use]
    pub fn advertised(&self) -> String {
        self.advertised_address
            .clone()
            .unwrap_or_else(|| self.listen_addr())
    }
}

/// Pool sizing and lifetime, cluster-wide totals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Pool provider name (`deadpool` or `direct`)
    #[serde(default = "super::defaults::pool_provider")]
    pub provider: String,
    #[serde(default = "super::defaults::pool_max_size")]
    pub max_size: MaxConnections,
    #[serde(default = "super::defaults::pool_min_idle")]
    pub min_idle: usize,
    #[serde(
        with = "duration_serde",
        default = "super::defaults::acquire_timeout"
    )]
    pub acquire_timeout: Duration,
    #[serde(with = "duration_serde", default = "super::defaults::idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_serde", default = "super::defaults::max_lifetime")]
    pub max_lifetime: Duration,
    /// Idle eviction and top-up period (0 disables)
    #[serde(
        with = "duration_serde",
        default = "super::defaults::maintenance_interval"
    )]
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            provider: super::defaults::pool_provider(),
            max_size: super::defaults::pool_max_size(),
            min_idle: super::defaults::pool_min_idle(),
            acquire_timeout: super::defaults::acquire_timeout(),
            idle_timeout: super::defaults::idle_timeout(),
            max_lifetime: super::defaults::max_lifetime(),
            maintenance_interval: super::defaults::maintenance_interval(),
        }
    }
}

/// Fast/slow slot segregation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegregationConfig {
    #[serde(default = "super::defaults::enabled")]
    pub enabled: bool,
    /// Share of the pool reserved for slow operations
    #[serde(default = "super::defaults::slow_fraction")]
    pub slow_fraction: f64,
    /// Fixed slow threshold in milliseconds; relative to the overall average when unset
    #[serde(
        with = "option_millis_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub slow_threshold: Option<Duration>,
    /// How long a partition must be idle before the other may borrow from it
    #[serde(with = "duration_serde", default = "super::defaults::borrow_window")]
    pub borrow_window: Duration,
    #[serde(
        with = "duration_serde",
        default = "super::defaults::stats_refresh_interval"
    )]
    pub refresh_interval: Duration,
}

impl Default for SegregationConfig {
    fn default() -> Self {
        Self {
            enabled: super::defaults::enabled(),
            slow_fraction: super::defaults::slow_fraction(),
            slow_threshold: None,
            borrow_window: super::defaults::borrow_window(),
            refresh_interval: super::defaults::stats_refresh_interval(),
        }
    }
}

/// Per-target circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "super::defaults::failure_threshold")]
    pub failure_threshold: MaxErrors,
    #[serde(with = "duration_serde", default = "super::defaults::cool_down")]
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: super::defaults::failure_threshold(),
            cool_down: super::defaults::cool_down(),
        }
    }
}

/// XA backend session pool, cluster-wide totals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct XaConfig {
    #[serde(default = "super::defaults::enabled")]
    pub enabled: bool,
    #[serde(default = "super::defaults::xa_max_size")]
    pub max_size: MaxConnections,
    #[serde(default = "super::defaults::xa_min_idle")]
    pub min_idle: usize,
}

impl Default for XaConfig {
    fn default() -> Self {
        Self {
            enabled: super::defaults::enabled(),
            max_size: super::defaults::xa_max_size(),
            min_idle: super::defaults::xa_min_idle(),
        }
    }
}

/// Session timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(
        with = "duration_serde",
        default = "super::defaults::statement_timeout"
    )]
    pub statement_timeout: Duration,
    /// Sessions idle this long are closed as leaked
    #[serde(
        with = "duration_serde",
        default = "super::defaults::session_idle_timeout"
    )]
    pub idle_timeout: Duration,
    /// How often leaked sessions are looked for (0 disables)
    #[serde(with = "duration_serde", default = "super::defaults::reap_interval")]
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            statement_timeout: super::defaults::statement_timeout(),
            idle_timeout: super::defaults::session_idle_timeout(),
            reap_interval: super::defaults::reap_interval(),
        }
    }
}

/// Relayed cluster health
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Client views older than this are ignored when sizing pools
    #[serde(with = "duration_serde", default = "super::defaults::view_ttl")]
    pub view_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            view_ttl: super::defaults::view_ttl(),
        }
    }
}

/// One backend target and its overrides of the node-wide pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasourceConfig {
    /// Backend driver name
    #[serde(default = "super::defaults::driver")]
    pub driver: String,
    /// Backend connection string; a client may supply its own
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<MaxConnections>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_idle: Option<usize>,
    #[serde(
        with = "option_duration_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub acquire_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xa_max_size: Option<MaxConnections>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xa_min_idle: Option<usize>,
}

impl DatasourceConfig {
    /// Datasource using `driver` at `url` with no overrides
    #[must_use]
    pub fn new(driver: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            url: url.into(),
            username: None,
            password: None,
            max_size: None,
            min_idle: None,
            acquire_timeout: None,
            xa_max_size: None,
            xa_min_idle: None,
        }
    }
}

/// Client router settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Attempts to open a session; -1 retries forever
    #[serde(default = "super::defaults::retry_attempts")]
    pub retry_attempts: i32,
    #[serde(with = "duration_serde", default = "super::defaults::retry_delay")]
    pub retry_delay: Duration,
    /// How often unhealthy nodes are considered for a probe
    #[serde(
        with = "duration_serde",
        default = "super::defaults::client_health_interval"
    )]
    pub health_check_interval: Duration,
    /// First probe delay after a node failed
    #[serde(
        with = "duration_serde",
        default = "super::defaults::client_health_threshold"
    )]
    pub health_check_threshold: Duration,
    #[serde(
        with = "duration_serde",
        default = "super::defaults::client_health_timeout"
    )]
    pub health_check_timeout: Duration,
    /// Upper bound of the doubling probe delay
    #[serde(
        with = "duration_serde",
        default = "super::defaults::max_probe_backoff"
    )]
    pub max_probe_backoff: Duration,
    /// Pick the node with the fewest sessions; round-robin otherwise
    #[serde(default = "super::defaults::enabled")]
    pub load_aware_selection: bool,
    #[serde(
        with = "duration_serde",
        default = "super::defaults::transport_timeout"
    )]
    pub transport_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_attempts: super::defaults::retry_attempts(),
            retry_delay: super::defaults::retry_delay(),
            health_check_interval: super::defaults::client_health_interval(),
            health_check_threshold: super::defaults::client_health_threshold(),
            health_check_timeout: super::defaults::client_health_timeout(),
            max_probe_backoff: super::defaults::max_probe_backoff(),
            load_aware_selection: super::defaults::enabled(),
            transport_timeout: super::defaults::transport_timeout(),
        }
    }
}

impl ClientConfig {
    /// Whether another open attempt is allowed after `attempts` tries
    #[must_use]
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        match u32::try_from(self.retry_attempts) {
            Ok(limit) => attempts < limit.max(1),
            Err(_) => true,
        }
    }
}
