//! Configuration validation
//!
//! This module provides validation logic for the configuration to ensure
//! all settings are valid before the node starts.

use anyhow::{Result, bail};
use std::time::Duration;
use tracing::warn;

use super::types::{ClientConfig, Config, DatasourceConfig};

impl Config {
    /// Validate configuration for correctness
    ///
    /// Non-zero sizes and non-empty names are enforced by their types. This
    /// checks the remaining semantic constraints:
    /// - At least one datasource configured
    /// - min idle ≤ max size, for the pools and every override
    /// - slow fraction in [0, 1]
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.datasources.is_empty() {
            bail!("Configuration must have at least one datasource");
        }
        if self.pool.min_idle > self.pool.max_size.get() {
            bail!(
                "pool.min_idle ({}) exceeds pool.max_size ({})",
                self.pool.min_idle,
                self.pool.max_size
            );
        }
        if self.xa.min_idle > self.xa.max_size.get() {
            bail!(
                "xa.min_idle ({}) exceeds xa.max_size ({})",
                self.xa.min_idle,
                self.xa.max_size
            );
        }
        let fraction = self.segregation.slow_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            bail!("segregation.slow_fraction must be between 0 and 1, got {fraction}");
        }

        for (name, datasource) in &self.datasources {
            self.validate_datasource(name, datasource)?;
        }

        timeouts_ordered(
            self.pool.acquire_timeout,
            self.session.statement_timeout,
            None,
        );
        Ok(())
    }

    fn validate_datasource(&self, name: &str, datasource: &DatasourceConfig) -> Result<()> {
        let max = datasource.max_size.unwrap_or(self.pool.max_size).get();
        let min = datasource.min_idle.unwrap_or(self.pool.min_idle);
        if min > max {
            bail!("datasource '{name}': min_idle ({min}) exceeds max_size ({max})");
        }
        let xa_max = datasource.xa_max_size.unwrap_or(self.xa.max_size).get();
        let xa_min = datasource.xa_min_idle.unwrap_or(self.xa.min_idle);
        if xa_min > xa_max {
            bail!("datasource '{name}': xa_min_idle ({xa_min}) exceeds xa_max_size ({xa_max})");
        }
        if datasource.driver.trim().is_empty() {
            bail!("datasource '{name}': driver cannot be empty");
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Validate client settings against the node's timeouts
    pub fn check_against(&self, node: &Config) -> bool {
        timeouts_ordered(
            node.pool.acquire_timeout,
            node.session.statement_timeout,
            Some(self.transport_timeout),
        )
    }
}

/// Warn unless pool acquire < statement < transport timeout
///
/// The innermost layer should fail first so the caller gets the most specific
/// error. Returns whether the ordering holds.
pub fn timeouts_ordered(acquire: Duration, statement: Duration, transport: Option<Duration>) -> bool {
    let mut ordered = true;
    if acquire >= statement {
        warn!(
            acquire_timeout_secs = acquire.as_secs(),
            statement_timeout_secs = statement.as_secs(),
            "Pool acquire timeout should be shorter than the statement timeout"
        );
        ordered = false;
    }
    if let Some(transport) = transport
        && statement >= transport
    {
        warn!(
            statement_timeout_secs = statement.as_secs(),
            transport_timeout_secs = transport.as_secs(),
            "Statement timeout should be shorter than the transport timeout"
        );
        ordered = false;
    }
    ordered
}
