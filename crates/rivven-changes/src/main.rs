//! rivven-changes - follow a CouchDB changes feed from the command line
//!
//! ```bash
//! # Ten records after seq 1283832
//! rivven-changes --db https://skimdb.npmjs.com/registry --since 1283832 --limit 10
//!
//! # From a config file, flags override file values
//! rivven-changes -c changes.yaml --limit 100
//!
//! # Print the config schema
//! rivven-changes schema
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rivven_changes::{AdaptErrorPolicy, ChangeSignal, ChangesAdapter, ChangesConfig, Seq};

#[derive(Parser)]
#[command(name = "rivven-changes")]
#[command(version, about = "Follow a CouchDB changes feed")]
struct Cli {
    /// Database URL
    #[arg(long)]
    db: Option<String>,

    /// Resume after this sequence (number, opaque seq or "now")
    #[arg(long)]
    since: Option<String>,

    /// Stop after this many records (negative means no limit)
    #[arg(short, long, allow_negative_numbers = true)]
    limit: Option<i64>,

    /// Do not ask the feed for documents
    #[arg(long)]
    no_docs: bool,

    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// End the stream on the first record that fails to adapt
    #[arg(long)]
    halt_on_error: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the feed and print records (default)
    Follow,
    /// Validate the configuration without connecting
    Validate,
    /// Print the configuration JSON schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::Schema) = cli.command {
        let schema = ChangesConfig::json_schema();
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = build_config(&cli)?;
    let adapter = ChangesAdapter::new(config).context("Invalid configuration")?;

    match cli.command {
        Some(Commands::Validate) => {
            println!("✓ Configuration is valid ({})", adapter.db());
            Ok(())
        }
        _ => follow(adapter).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries the records
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_config(cli: &Cli) -> Result<ChangesConfig> {
    let mut config = match cli.config {
        Some(ref path) => ChangesConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ChangesConfig::default(),
    };

    if let Some(ref db) = cli.db {
        config.db = Some(db.clone());
    }
    if let Some(ref since) = cli.since {
        config.since = Some(Seq::from(since.as_str()));
    }
    if let Some(limit) = cli.limit {
        config.limit = Some(limit);
    }
    if cli.no_docs {
        config.include_docs = false;
    }
    if cli.halt_on_error {
        config.on_adapt_error = AdaptErrorPolicy::Halt;
    }

    Ok(config)
}

async fn follow(adapter: ChangesAdapter) -> Result<()> {
    let mut stream = adapter
        .create_stream()
        .context("Failed to open changes stream")?;
    let stats = stream.stats();
    let mut fatal = None;

    loop {
        let signal = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping");
                break;
            }
            signal = stream.next() => signal,
        };

        match signal {
            Some(ChangeSignal::Record(record)) => println!("{} {}", record.seq, record.id),
            Some(ChangeSignal::Current(seq)) => info!("caught up to current update: {}", seq),
            Some(ChangeSignal::Error(e)) => {
                error!("[{}] {}", e.error_code(), e);
                if e.is_fatal() {
                    fatal = Some(e);
                }
            }
            None => break,
        }
    }

    let snapshot = stats.snapshot();
    info!(
        "Read {} change(s), emitted {} record(s), {} error(s)",
        snapshot.events_received,
        snapshot.records_emitted,
        snapshot.adapt_errors + snapshot.upstream_errors
    );
    println!("done");

    match fatal {
        Some(e) => Err(e).context("Changes stream failed"),
        None => Ok(()),
    }
}
