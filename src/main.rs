//! pow-node: run a peer of the proof-of-work network
//!
//! Loads the chain from the data directory, starts networking and logs
//! statistics until interrupted.

use clap::Parser;
use pow_node::network::params::PORT;
use pow_node::network::{Node, NodeConfig};
use pow_node::storage::{Storage, StorageConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pow-node")]
#[command(version)]
#[command(about = "Proof-of-work peer-to-peer node", long_about = None)]
struct Cli {
    /// Data directory holding the chain and the address book
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value_t = PORT)]
    port: u16,

    /// Do not accept incoming connections
    #[arg(long)]
    dont_listen: bool,

    /// Peer to connect to (host:port); may be repeated
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Seconds between statistics reports
    #[arg(long, default_value = "60")]
    stats_interval: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let storage = Arc::new(Storage::new(StorageConfig {
        data_dir: cli.data_dir.clone(),
        ..Default::default()
    })?);

    log::info!("Reading chain from {}", storage.chain_path().display());
    let coinstate = storage.read_chain_from_disk()?;

    let config = NodeConfig {
        port: cli.port,
        listen: !cli.dont_listen,
        bootstrap_peers: cli.peers,
    };
    let node = Node::start(config, coinstate, storage)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(report_until_interrupted(
        &node,
        Duration::from_secs(cli.stats_interval.max(1)),
    ));

    log::info!("Shutting down...");
    node.stop();
    node.join()?;
    Ok(())
}

async fn report_until_interrupted(node: &Node, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("Could not listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = ticker.tick() => {
                if !node.is_running() {
                    log::error!("Networking stopped unexpectedly");
                    break;
                }
                log::info!("Node statistics\n{}", node.stats());
            }
        }
    }
}
