//! # Media Downloads Entry Point
//!
//! `serve` (default) runs the HTTP API with the download orchestrator and the
//! cleanup sweep; `migrate` applies schema migrations; `cleanup` runs a
//! single sweep and exits.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use media_downloads::{
    cleanup::CleanupService, config::ConfigLoader, db, repositories::JobStore, server::run_server,
    telemetry, worker::WorkerSettings,
};

#[derive(Debug, Parser)]
#[command(name = "media-downloads", version, about = "Offline copies of remote media")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and background workers
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Run one cleanup sweep and exit
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config, db)
            .await
            .map_err(|e| anyhow!("server error: {e}")),
        Command::Migrate => {
            tracing::info!("Migrations complete");
            Ok(())
        }
        Command::Cleanup => {
            let service = CleanupService::new(
                JobStore::new(db),
                WorkerSettings::from(&config.downloads),
                config.cleanup.clone(),
            );
            let stats = service.tick().await.context("running cleanup sweep")?;
            tracing::info!(
                expired = stats.expired_rows_removed,
                orphans = stats.orphan_dirs_removed,
                errors = stats.errors,
                "Cleanup sweep finished"
            );
            Ok(())
        }
    }
}
