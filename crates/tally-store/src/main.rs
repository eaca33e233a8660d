//! tally-store: remote document store for tally clients.
//!
//! Holds one budget document per user, applies last-writer-wins conditional
//! writes and pushes every accepted change to subscribed connections.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tally_core::SystemClock;
use tally_store::{SnapshotStorage, StoreServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tally-store")]
#[command(about = "Remote document store for tally")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9470", env = "TALLY_STORE_LISTEN")]
    listen: String,

    /// Snapshot file for documents (in-memory only if omitted)
    #[arg(short, long, env = "TALLY_STORE_DATA")]
    data: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,tally_store=debug"
    } else {
        "info,tally_store=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting tally-store");
    match &args.data {
        Some(path) => info!("Snapshot file: {:?}", path),
        None => info!("No snapshot file, documents are kept in memory"),
    }

    let storage = args.data.map(SnapshotStorage::new);
    let server = StoreServer::new(storage, Arc::new(SystemClock))?;
    let listener = StoreServer::bind(&args.listen).await?;

    info!("Store running. Press Ctrl+C to stop.");

    tokio::select! {
        result = server.run(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
