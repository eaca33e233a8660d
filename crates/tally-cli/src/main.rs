//! tally: command-line client for the tally budget tracker.
//!
//! Every invocation starts a sync session against the local data directory
//! (and the remote store, when configured), applies one command, and waits
//! for the change to reach the remote before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tally_cli::commands::{Command, render, render_status};
use tally_cli::{Config, session};
use tally_core::{Clock, SyncEvent, SyncHandle, SystemClock, export_json, import_json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Offline-first budget tracker")]
struct Cli {
    /// Directory for local data and config.json
    #[arg(long, global = true, default_value = ".tally", env = "TALLY_DATA_DIR")]
    data_dir: PathBuf,

    /// Remote store URL, overriding config.json
    #[arg(long, global = true, env = "TALLY_REMOTE")]
    remote: Option<String>,

    /// Signed-in user id, overriding config.json
    #[arg(long, global = true, env = "TALLY_USER")]
    user: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to warnings (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,tally_cli=debug,tally_core=debug"
    } else {
        "warn,tally_cli=info,tally_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(&cli.data_dir)?;
    if cli.remote.is_some() {
        config.remote_url = cli.remote.clone();
    }
    if cli.user.is_some() {
        config.user_id = cli.user.clone();
    }
    debug!("Data directory: {:?}", cli.data_dir);

    let handle = session::start(&config, &cli.data_dir)?;
    let status = handle.wait_ready().await?;
    debug!("Session ready: {}", render_status(&status));

    let result = run_command(&cli.command, &handle).await;

    let limit = config.timeout() + config.sync_config().debounce;
    let decision = session::finish(&handle, limit).await?;
    if decision.prompt {
        warn!("Changes are saved locally but not yet synced; they will sync on the next run");
    }
    result
}

async fn run_command(command: &Command, handle: &SyncHandle) -> Result<()> {
    match command {
        Command::Show => {
            print!("{}", render(&handle.state(), &handle.status()));
        }
        Command::Export { output } => {
            let json = export_json(&handle.state());
            match output {
                Some(path) => {
                    std::fs::write(path, json)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    info!("Exported to {:?}", path);
                }
                None => println!("{json}"),
            }
        }
        Command::Import { path } => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            let state = import_json(&content).with_context(|| format!("Cannot import {:?}", path))?;
            handle.import_data(state).await?;
            info!("Imported {:?}", path);
        }
        Command::Watch => watch(handle).await?,
        _ => {
            let action = command.to_action(&handle.state(), SystemClock.now_ms())?;
            if let Some(action) = action {
                handle.dispatch(action).await?;
            }
        }
    }
    Ok(())
}

/// Print sync events until Ctrl+C.
///
/// The first Ctrl+C with unsynced changes flushes them locally and keeps
/// waiting for the write; a second one quits regardless.
async fn watch(handle: &SyncHandle) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = handle.events().subscribe(move |event: SyncEvent| {
        let _ = tx.send(event);
    });
    let mut state_rx = handle.watch_state();

    println!("{}", render_status(&handle.status()));
    let mut interrupted = false;

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => debug!("Unprintable event: {}", e),
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let sheets = state_rx.borrow_and_update().sheets.len();
                println!("{} {} sheet(s)", render_status(&handle.status()), sheets);
            }
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    break;
                }
                let decision = handle.before_unload().await?;
                if !decision.prompt {
                    break;
                }
                eprintln!("Unsynced changes were saved locally. Waiting for sync; press Ctrl+C again to quit.");
                interrupted = true;
            }
            _ = handle.wait_idle(), if interrupted => {
                break;
            }
        }
    }
    Ok(())
}
