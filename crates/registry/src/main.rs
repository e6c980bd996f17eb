//! pgreg operator binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgreg_registry::config::CONFIG_PATH_ENV;
use pgreg_registry::{EngineState, Registry, load_config};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// pgreg - PostgreSQL storage for a package registry
#[derive(Parser, Debug)]
#[command(name = "pgreg")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = "config/pgreg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate,
    /// List defined migrations and when each was applied
    Status,
    /// Migrate, read the core tables and check connectivity
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("pgreg v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli.config).context("failed to load configuration")?;
    let registry = Registry::open(config).context("failed to open storage")?;

    match cli.command {
        Commands::Migrate => {
            let applied = registry.startup().await.context("migration failed")?;
            if applied.is_empty() {
                println!("Schema is up to date");
            }
            for name in applied {
                println!("applied {name}");
            }
        }
        Commands::Status => {
            let statuses = registry
                .migration_status()
                .await
                .context("failed to read migration ledger")?;
            for status in statuses {
                match status.applied_at {
                    Some(at) => println!("{:<24} applied {at}", status.name),
                    None => println!("{:<24} pending", status.name),
                }
            }
        }
        Commands::Check => {
            registry.startup().await.context("startup failed")?;
            registry
                .health_check()
                .await
                .context("database health check failed")?;
            match registry.state() {
                EngineState::Ready => println!("ready"),
                EngineState::Degraded(reason) => {
                    anyhow::bail!("storage engine degraded: {reason}");
                }
            }
        }
    }

    Ok(())
}
