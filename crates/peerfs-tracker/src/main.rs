//! peerfs tracker -- keeps the inventory of which node holds which blocks.
//!
//! Usage:
//!   peerfs-tracker                          # Run with default config
//!   peerfs-tracker --config tracker.toml    # Run with custom config
//!   peerfs-tracker -p 9090 --db fs.sqlite   # Override individual settings

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use peerfs_inventory::{Inventory, SqliteInventory};
use peerfs_tracker::config::TrackerConfig;
use peerfs_tracker::{SessionConfig, TrackerServer};

#[derive(Parser)]
#[command(name = "peerfs-tracker", about = "peerfs tracker: block inventory for file-sharing nodes")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tracker.toml")]
    config: PathBuf,

    /// Port to listen on (all interfaces)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database file
    #[arg(long)]
    db: Option<String>,

    /// Maximum concurrent node connections
    #[arg(short = 'm', long)]
    max_connections: Option<usize>,

    /// Connection idle timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Keep the inventory from the previous run instead of rebuilding it
    #[arg(long)]
    keep_inventory: bool,

    /// Verbose logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.debug {
        "peerfs_tracker=debug,peerfs_inventory=debug"
    } else {
        "peerfs_tracker=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();

    let mut cfg = TrackerConfig::load_or_default(&cli.config)?;
    if let Some(port) = cli.port {
        cfg.tracker.listen_addr = format!("0.0.0.0:{port}");
    }
    if let Some(db) = cli.db {
        cfg.tracker.database = db;
    }
    if let Some(max) = cli.max_connections {
        cfg.tracker.max_connections = max;
    }
    if let Some(timeout) = cli.timeout {
        cfg.tracker.idle_timeout_secs = timeout;
    }
    if cli.keep_inventory {
        cfg.tracker.reset_on_start = false;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.tracker.listen_addr,
        max_connections = cfg.tracker.max_connections,
        idle_timeout_secs = cfg.tracker.idle_timeout_secs,
        "starting peerfs-tracker"
    );

    let db_path = PathBuf::from(&cfg.tracker.database);
    let inventory = SqliteInventory::open(&db_path, cfg.tracker.reset_on_start)?;
    let inventory: Arc<dyn Inventory> = Arc::new(inventory);
    tracing::info!(
        db = %db_path.display(),
        reset = cfg.tracker.reset_on_start,
        "inventory opened"
    );

    let server = TrackerServer::bind(
        &cfg.tracker.listen_addr,
        inventory,
        SessionConfig::from(&cfg.tracker),
        cfg.tracker.max_connections,
    )
    .await?;
    tracing::info!(addr = %server.local_addr()?, "tracker listening");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let server_handle = tokio::spawn(server.serve(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}
