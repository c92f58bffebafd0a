//! Configuration loading from files and environment variables
//!
//! Environment variables take precedence over the file for container
//! deployments:
//! - `OJP_NODE_HOST`, `OJP_NODE_PORT`
//! - `OJP_POOL_MAX_SIZE`, `OJP_POOL_MIN_IDLE`
//! - `OJP_POOL_ACQUIRE_TIMEOUT` (seconds)

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::types::{Config, DatasourceConfig};
use crate::types::{DatasourceName, MaxConnections, Port};

fn env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Apply `OJP_*` environment overrides
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(host) = std::env::var("OJP_NODE_HOST") {
        config.node.host = host;
    }
    if let Some(port) = env_var::<Port>("OJP_NODE_PORT") {
        config.node.port = port;
    }
    if let Some(max) = env_var::<usize>("OJP_POOL_MAX_SIZE").and_then(MaxConnections::new) {
        config.pool.max_size = max;
    }
    if let Some(min) = env_var::<usize>("OJP_POOL_MIN_IDLE") {
        config.pool.min_idle = min;
    }
    if let Some(secs) = env_var::<u64>("OJP_POOL_ACQUIRE_TIMEOUT") {
        config.pool.acquire_timeout = Duration::from_secs(secs);
    }
}

/// Parse and validate a TOML configuration string
///
/// # Errors
///
/// Returns an error if the TOML is malformed or fails validation.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file, with environment variable overrides
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<Config> {
    let path = config_path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
    apply_env_overrides(&mut config);
    config
        .validate()
        .with_context(|| format!("Invalid config file '{}'", path.display()))?;
    Ok(config)
}

/// Load `config_path`, writing a default configuration there first if it is missing
///
/// # Errors
///
/// Returns an error if an existing file is invalid or the default cannot be written.
pub fn load_or_create_config(config_path: impl AsRef<Path>) -> Result<Config> {
    let path = config_path.as_ref();
    if path.exists() {
        return load_config(path);
    }

    warn!(path = %path.display(), "Config file not found, creating default config");
    let default_config = create_default_config();
    let toml = toml::to_string_pretty(&default_config).context("Failed to render default config")?;
    std::fs::write(path, toml)
        .with_context(|| format!("Failed to write default config to '{}'", path.display()))?;
    info!(path = %path.display(), "Wrote default config");

    let mut config = default_config;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Default configuration: one in-process memory datasource named `default`
#[must_use]
pub fn create_default_config() -> Config {
    let mut config = Config::default();
    config.datasources.insert(
        DatasourceName::default(),
        DatasourceConfig::new("memory", "mem://default"),
    );
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = create_default_config();
        config.validate().unwrap();
        assert_eq!(config.node.port.get(), 1059);
        assert_eq!(config.pool.max_size.get(), 20);
        assert_eq!(config.pool.min_idle, 5);
        assert_eq!(config.segregation.slow_fraction, 0.2);
        assert_eq!(config.circuit_breaker.failure_threshold.get(), 3);
        assert_eq!(config.xa.max_size.get(), 10);
    }

    #[test]
    fn test_parse_minimal_file_uses_defaults() {
        let config = parse_config(
            r#"
            [datasources.default]
            url = "mem://orders"
            "#,
        )
        .unwrap();
        let ds = &config.datasources[&DatasourceName::default()];
        assert_eq!(ds.driver, "memory");
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.session.statement_timeout, Duration::from_secs(30));
        assert_eq!(config.cluster.view_ttl, Duration::from_secs(30));
        assert!(config.segregation.slow_threshold.is_none());
    }

    #[test]
    fn test_parse_full_file() {
        let config = parse_config(
            r#"
            [node]
            host = "127.0.0.1"
            port = 2059
            advertised_address = "db-proxy-1:2059"

            [pool]
            provider = "direct"
            max_size = 30
            min_idle = 6
            acquire_timeout = 5

            [segregation]
            slow_fraction = 0.25
            slow_threshold = 250
            borrow_window = 15

            [circuit_breaker]
            failure_threshold = 5
            cool_down = 30

            [xa]
            enabled = false

            [datasources.orders]
            driver = "memory"
            url = "mem://orders"
            username = "app"
            max_size = 12
            xa_max_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.node.advertised(), "db-proxy-1:2059");
        assert_eq!(config.pool.provider, "direct");
        assert_eq!(
            config.segregation.slow_threshold,
            Some(Duration::from_millis(250))
        );
        assert!(!config.xa.enabled);
        let orders = &config.datasources[&DatasourceName::new("orders".into()).unwrap()];
        assert_eq!(orders.max_size.map(|m| m.get()), Some(12));
        assert_eq!(orders.username.as_deref(), Some("app"));
    }

    #[test]
    fn test_rejects_min_idle_above_max() {
        let err = parse_config(
            r#"
            [pool]
            max_size = 2
            min_idle = 3
            [datasources.default]
            url = "mem://x"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_idle"));
    }

    #[test]
    fn test_rejects_bad_slow_fraction() {
        let err = parse_config(
            r#"
            [segregation]
            slow_fraction = 1.5
            [datasources.default]
            url = "mem://x"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("slow_fraction"));
    }

    #[test]
    fn test_rejects_missing_datasources() {
        assert!(parse_config("[pool]\nmax_size = 5\n").is_err());
    }

    #[test]
    fn test_rejects_zero_pool_size() {
        let err = parse_config(
            r#"
            [pool]
            max_size = 0
            [datasources.default]
            url = "mem://x"
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[datasources.default]\nurl = \"mem://file\"").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(
            config.datasources[&DatasourceName::default()].url,
            "mem://file"
        );
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let config = load_or_create_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.datasources.len(), 1);

        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded.datasources, config.datasources);
    }

    #[test]
    fn test_missing_file_error_names_path() {
        let err = load_config("/nonexistent/ojp.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ojp.toml"));
    }
}
