use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use bully_replication::{
    cli::{Cli, Command},
    client,
    config::NodeConfig,
    runtime::spawn_node,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let config = NodeConfig::from_args(&args)?;
            let node = spawn_node(config).await?;
            info!("node {} listening on {}", node.id(), node.local_addr());
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err:?}");
            }
            node.shutdown().await;
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
