//! Command-line arguments for the node binary

use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;
use crate::types::Port;

/// Proxy node command line
///
/// Every flag can also be set through the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct NodeArgs {
    /// Configuration file; created with defaults if missing
    #[arg(short, long, default_value = "ojp.toml", env = "OJP_CONFIG")]
    pub config: PathBuf,

    /// Host to bind to (overrides config file)
    #[arg(long, env = "OJP_HOST")]
    pub host: Option<String>,

    /// Port to listen on (overrides config file)
    #[arg(short, long, env = "OJP_PORT")]
    pub port: Option<Port>,

    /// Worker threads, 0 for one per CPU core (overrides config file)
    #[arg(short, long, env = "OJP_THREADS")]
    pub threads: Option<usize>,
}

impl NodeArgs {
    /// Apply command-line overrides to a loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.node.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.node.port = port;
        }
        if let Some(threads) = self.threads {
            config.node.threads = threads;
        }
    }
}
