//! Shard distributor binary

use clap::{Parser, Subcommand};
use shard_distributor::store::BackendTable;
use shard_distributor::{Config, ShardDistributor};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shard-distributor")]
#[command(about = "Shard distributor with per-namespace leader election")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the distributor
    Serve {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Identity used when campaigning (defaults to $HOSTNAME)
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Load and validate a configuration file, then exit
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, hostname } => {
            let config = Config::load(config.as_deref())?;
            init_tracing(&config.log_level);

            let hostname = hostname.unwrap_or_else(default_hostname);
            let distributor = ShardDistributor::new(config, hostname, &BackendTable::with_defaults())?;
            distributor
                .serve(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for shutdown signal: {}", e);
                    }
                })
                .await?;
        }
        Commands::CheckConfig { config } => {
            let config = Config::load(Some(&config))?;
            println!("Configuration OK");
            println!("  Backend: {}", config.leader_election.store.backend);
            for ns in &config.namespaces {
                println!(
                    "  Namespace: {} ({:?}, {:?}, {} shards)",
                    ns.name, ns.namespace_type, ns.mode, ns.shard_num
                );
            }
        }
    }

    Ok(())
}
