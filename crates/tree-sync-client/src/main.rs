//! tree-sync: mirror a remote file tree over WebSocket.
//!
//! `watch` stays connected and logs replica changes until Ctrl+C; `run`
//! issues a single operation and prints the authority's answer.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tree_sync_client::{Client, ClientConfig};
use tree_sync_core::SyncEvent;

#[derive(Parser, Debug)]
#[command(name = "tree-sync")]
#[command(about = "Mirror a remote file tree")]
struct Args {
    /// WebSocket address of the authority (falls back to TREE_SYNC_URL)
    #[arg(short, long)]
    url: Option<String>,

    /// Remote path to watch (repeatable)
    #[arg(short, long = "watch")]
    watch: Vec<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and log changes (default)
    Watch,
    /// Issue one operation, e.g. `run writeFile /notes/todo.md`
    Run {
        method: String,
        /// Arguments; each is parsed as JSON, or taken as a string
        args: Vec<String>,
    },
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::TreeChanged { snapshot, .. } => {
            info!(
                "Tree changed: {} node(s) under {}",
                snapshot.nodes.len(),
                snapshot.root_path.as_deref().unwrap_or("?")
            );
        }
        SyncEvent::NodeChanged {
            operation, path, new_path, ..
        } => match new_path {
            Some(new_path) => debug!("{} {} -> {}", operation, path, new_path),
            None => debug!("{} {}", operation, path),
        },
        SyncEvent::Fatal { kind, message, .. } => {
            error!("Fatal ({}): {}", kind, message);
        }
    }
}

async fn watch(mut client: Client) -> Result<()> {
    let _subscription = client.sync().subscribe(log_event);
    info!("Watching. Press Ctrl+C to stop.");

    tokio::select! {
        _ = client.closed() => {
            info!("Authority closed the connection");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    client.shutdown().await?;
    Ok(())
}

async fn run(client: Client, method: String, args: Vec<String>) -> Result<()> {
    let args = args.iter().map(|a| parse_arg(a)).collect();

    let outcome = tokio::select! {
        outcome = client.run(&method, args) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(outcome) = outcome else {
        info!("Interrupted");
        client.shutdown().await?;
        anyhow::bail!("{} interrupted", method);
    };

    let result = outcome.with_context(|| format!("{} failed", method));
    if let Ok(value) = &result {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    client.shutdown().await?;
    result.map(|_| ())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,tree_sync_core=debug,tree_sync_client=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = args.url {
        config = config.with_url(url)?;
    }
    let config = config.with_watch_paths(args.watch)?;

    info!("Starting tree-sync");
    info!("Authority: {}", config.url);

    let client = Client::connect(&config).await?;

    match args.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(client).await,
        Command::Run { method, args } => run(client, method, args).await,
    }
}
