//! peerfs node -- shares a directory of files with other nodes.
//!
//! Usage:
//!   peerfs-node                                   # Run with default config
//!   peerfs-node --config node.toml                # Run with custom config
//!   peerfs-node -d ~/share -b 512 -t 10.0.0.1:9090

use std::sync::Arc;

use clap::Parser;
use peerfs_blockstore::{BlockStore, FsBlockStore};
use peerfs_node::commands::{self, HELP};
use peerfs_node::config::NodeConfig;
use peerfs_node::control::TrackerClient;
use peerfs_node::controller::Node;
use peerfs_node::expand_tilde;
use peerfs_transfer::TransferEngine;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "peerfs-node", about = "peerfs node: share files with peers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.peerfs/node.toml")]
    config: String,

    /// Storage directory
    #[arg(short, long)]
    directory: Option<String>,

    /// Block size used to divide local files
    #[arg(short, long)]
    block_size: Option<u16>,

    /// Tracker address (host:port)
    #[arg(short, long)]
    tracker: Option<String>,

    /// Local UDP address for block transfers
    #[arg(short, long)]
    udp: Option<String>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.debug {
        "peerfs_node=debug,peerfs_transfer=debug,peerfs_blockstore=debug"
    } else {
        "peerfs_node=info,peerfs_transfer=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = NodeConfig::load_or_default(&expand_tilde(&cli.config))?;
    if let Some(directory) = cli.directory {
        cfg.node.directory = directory;
    }
    if let Some(block_size) = cli.block_size {
        cfg.node.block_size = block_size;
    }
    if let Some(tracker) = cli.tracker {
        cfg.node.tracker_addr = tracker;
    }
    if let Some(udp) = cli.udp {
        cfg.node.udp_addr = udp;
    }
    if cfg.node.block_size == 0 {
        anyhow::bail!("block size must be at least 1");
    }

    run_node(cfg).await
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        directory = %cfg.node.directory,
        block_size = cfg.node.block_size,
        tracker = %cfg.node.tracker_addr,
        "starting peerfs-node"
    );

    let root = expand_tilde(&cfg.node.directory);
    let store = FsBlockStore::open(&root)?;
    let store: Arc<dyn BlockStore> = Arc::new(store);
    tracing::info!(root = %root.display(), "block store opened");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let engine = TransferEngine::bind(&cfg.node.udp_addr, store, cfg.transfer.clone()).await?;
    let engine_handle = engine.spawn(shutdown_tx.subscribe());

    let tracker = TrackerClient::connect(&cfg.node.tracker_addr, cfg.node.read_timeout()).await?;
    let mut node = Node::new(engine, tracker, cfg.node.block_size, cfg.node.peer_port);

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, leaving network");
                if let Err(e) = node.leave().await {
                    tracing::warn!("leave failed: {e}");
                }
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        match commands::execute(&mut node, command).await {
            Ok(outcome) => {
                match &outcome.output {
                    serde_json::Value::String(text) => println!("{text}"),
                    value => println!("{}", serde_json::to_string_pretty(value)?),
                }
                if outcome.quit {
                    break;
                }
            }
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    tracing::info!("shutting down...");
    let _ = shutdown_tx.send(());
    let _ = engine_handle.await;
    tracing::info!("shutdown complete");
    Ok(())
}
