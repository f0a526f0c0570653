//! Runline job engine daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use runline_config::{ServiceConfig, load_service_config};
use runline_db::PgStore;
use runline_executor::RunnerRegistry;
use runline_scheduler::Service;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runline")]
#[command(about = "Runline job engine", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "RUNLINE_CONFIG", default_value = "runline.kdl")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = load_config(&cli.config)?;
    let registry = RunnerRegistry::from_config(&config)?;
    info!(runners = ?registry.names(), "Configuration loaded");
    if cli.check {
        return Ok(());
    }

    info!("Connecting to database...");
    let pool = runline_db::connect(&config.database_url)
        .await
        .context("cannot open database")?;

    let mut service = Service::new(config, Arc::new(PgStore::new(pool)), registry);
    service.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("Shutdown requested");
    service.shutdown().await;

    Ok(())
}

/// Load the configuration file, or use defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<ServiceConfig> {
    if path.exists() {
        return load_service_config(path)
            .with_context(|| format!("cannot load configuration from {}", path.display()));
    }

    info!(path = %path.display(), "No configuration file, using defaults");
    let mut config = ServiceConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
