//! Tokio runtime construction and process-level helpers for the binary

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::node::ProxyNode;

/// Runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    worker_threads: usize,
}

impl RuntimeConfig {
    /// Worker count from configuration; 0 means one per CPU core
    #[must_use]
    pub fn from_threads(threads: usize) -> Self {
        let worker_threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            threads
        };
        Self { worker_threads }
    }

    #[must_use]
    pub const fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    #[must_use]
    pub const fn is_single_threaded(&self) -> bool {
        self.worker_threads == 1
    }

    /// Build the tokio runtime
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created.
    pub fn build_runtime(self) -> Result<tokio::runtime::Runtime> {
        let runtime = if self.is_single_threaded() {
            info!("Starting proxy node with single-threaded runtime");
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
        } else {
            info!(
                worker_threads = self.worker_threads,
                "Starting proxy node with multi-threaded runtime"
            );
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(self.worker_threads)
                .enable_all()
                .build()?
        };
        Ok(runtime)
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Log the datasources a node serves
pub fn log_config(config: &Config) {
    info!(
        listen = %config.node.listen_addr(),
        advertised = %config.node.advertised(),
        provider = %config.pool.provider,
        pool_max = config.pool.max_size.get(),
        xa = config.xa.enabled,
        "Loaded configuration"
    );
    for (name, datasource) in &config.datasources {
        info!(datasource = %name, driver = %datasource.driver, url = %datasource.url, "Datasource");
    }
}

/// Shut the node down on the first shutdown signal
pub fn spawn_shutdown_handler(node: &Arc<ProxyNode>) {
    let node = Arc::clone(node);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signals");
            return;
        }
        info!("Shutdown signal received");
        node.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_thread_count() {
        let config = RuntimeConfig::from_threads(4);
        assert_eq!(config.worker_threads(), 4);
        assert!(!config.is_single_threaded());
        assert!(RuntimeConfig::from_threads(1).is_single_threaded());
    }

    #[test]
    fn test_zero_uses_cpu_count() {
        assert!(RuntimeConfig::from_threads(0).worker_threads() >= 1);
    }

    #[test]
    fn test_builds_current_thread_runtime() {
        let runtime = RuntimeConfig::from_threads(1).build_runtime().unwrap();
        assert_eq!(runtime.block_on(async { 2 + 2 }), 4);
    }
}
