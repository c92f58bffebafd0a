use anyhow::Result;
use clap::Parser;

use ojp_proxy::args::NodeArgs;
use ojp_proxy::config::load_or_create_config;
use ojp_proxy::logging::init_dual_logging;
use ojp_proxy::node::{NodeServer, ProxyNode};
use ojp_proxy::runtime::{RuntimeConfig, log_config, spawn_shutdown_handler};

fn main() -> Result<()> {
    let _guard = init_dual_logging();
    let args = NodeArgs::parse();

    let mut config = load_or_create_config(&args.config)?;
    args.apply(&mut config);
    config.validate()?;
    log_config(&config);

    RuntimeConfig::from_threads(config.node.threads)
        .build_runtime()?
        .block_on(async move {
            let listen = config.node.listen_addr();
            let node = ProxyNode::builder(config).build();
            node.start_background_tasks();
            spawn_shutdown_handler(&node);

            let server = NodeServer::bind(node.clone(), &listen).await?;
            server.run().await?;
            node.shutdown().await;
            Ok(())
        })
}
