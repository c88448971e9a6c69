//! Channel Server - Main Entry Point
//!
//! Runs a single shard: loads configuration, builds the dispatch table,
//! starts the server workers, and waits for a termination signal.

use anyhow::Result;
use channel_server::{config, core_dispatch_table, logging, shutdown, Server};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use channel_server::config::Args;
use channel_server::repository::MemoryRepository;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = Instant::now();

    let args = Args::parse();

    // Configuration is read before logging starts so the [logging] section
    // can pick the level and format.
    let config_existed = args.config.exists();
    let mut file_config = config::load_config(&args).await?;
    args.apply_overrides(&mut file_config);

    logging::setup_logging(&args, file_config.logging.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting Channel Server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if config_existed {
        info!("Configuration loaded from: {}", args.config.display());
    } else {
        warn!(
            "Configuration file not found; wrote defaults to {}",
            args.config.display()
        );
    }

    let shard_config = file_config.to_shard_config()?;

    // The dispatch table is built exactly once here; embedders register
    // their game handlers on top of the core table before constructing the
    // server.
    let dispatch = core_dispatch_table();

    // Real deployments wire database-backed repositories here.
    let repo = Arc::new(MemoryRepository::new());
    let server = Server::new(shard_config, dispatch, repo.clone(), repo);

    let shutdown_rx = shutdown::setup_shutdown_handler().await;

    server.start().await?;
    info!("Startup complete in {:.2?}", startup_start.elapsed());

    let _ = shutdown_rx.await;
    let shutdown_start = Instant::now();
    server.shutdown();
    info!("Server shutdown completed in {:.2?}", shutdown_start.elapsed());

    Ok(())
}
