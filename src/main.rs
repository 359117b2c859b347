// ABOUTME: CLI entry point for entity-replicator
// ABOUTME: Parses commands and routes to appropriate handlers

use clap::{Args, Parser, Subcommand};
use entity_replicator::commands;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "entity-replicator")]
#[command(
    about = "Copy an entity and its reachable relationship graph from one datastore into another",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct StoreArgs {
    /// Path to the replicator configuration (TOML)
    #[arg(long)]
    config: PathBuf,
    /// Source store URL or path (overrides the configuration file)
    #[arg(long, env = "REPLICATOR_SOURCE")]
    source: Option<String>,
    /// Target store URL or path (overrides the configuration file)
    #[arg(long, env = "REPLICATOR_TARGET")]
    target: Option<String>,
    /// Batch size (overrides the configuration file)
    #[arg(long, env = "REPLICATOR_BATCH_SIZE")]
    batch_size: Option<i64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate root entities and everything they reach into the target store
    ///
    /// Prints one JSON object per root with its source and target ids.
    Sync {
        #[command(flatten)]
        stores: StoreArgs,
        /// Entity type of the roots
        #[arg(long = "entity")]
        entity_type: String,
        /// Source id of a root (repeatable)
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
        /// Reuse and record identifier mappings in this file
        #[arg(long)]
        mappings: Option<PathBuf>,
    },
    /// Validate the configuration and print the declared relation graph
    Check {
        #[command(flatten)]
        stores: StoreArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync {
            stores,
            entity_type,
            ids,
            mappings,
        } => {
            commands::sync::run(commands::SyncOptions {
                config: stores.config,
                entity_type,
                ids,
                source: stores.source,
                target: stores.target,
                batch_size: stores.batch_size,
                mappings,
            })
            .await
        }
        Commands::Check { stores } => {
            commands::check::run(commands::CheckOptions {
                config: stores.config,
                source: stores.source,
                target: stores.target,
                batch_size: stores.batch_size,
            })
            .await
        }
    }
}
