//! # Message Ingestor Main Entry Point
//!
//! Runs either the HTTP ingestion API (default), the batch coordinator
//! worker, or the migration commands.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use ingestor::{
    buffer::{MetricsStore, RedisStore},
    config::{AppConfig, ConfigLoader},
    db,
    server::run_server,
    telemetry,
    worker::BatchCoordinator,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "ingestor")]
#[command(about = "Elastic message ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP ingestion API (default)
    Api,
    /// Run the batch coordinator worker
    Worker,
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load()?;
    telemetry::init_tracing(&config)?;

    match cli.command.unwrap_or(Commands::Api) {
        Commands::Migrate { action } => {
            let db = db::init_pool(&config).await?;
            handle_migrate_command(&db, action).await
        }
        Commands::Api => run_api(config).await,
        Commands::Worker => run_worker(config).await,
    }
}

async fn run_api(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db = db::init_pool(&config).await?;
    migrate_for_local_profiles(&config, &db).await?;

    let store: Arc<dyn MetricsStore> = Arc::new(RedisStore::connect(&config.buffer_url()).await?);

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    run_server(config, db, store).await
}

async fn run_worker(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db = db::init_pool(&config).await?;
    migrate_for_local_profiles(&config, &db).await?;

    let store: Arc<dyn MetricsStore> = Arc::new(RedisStore::connect(&config.buffer_url()).await?);

    let shutdown = CancellationToken::new();
    let coordinator = BatchCoordinator::new(Arc::new(config), Arc::new(db), store);
    let handle = tokio::spawn(coordinator.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    handle.await??;
    Ok(())
}

/// Local and test profiles apply migrations automatically at startup.
async fn migrate_for_local_profiles(
    config: &AppConfig,
    db: &DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.profile == "local" || config.profile == "test" {
        info!(profile = %config.profile, "Running migrations automatically");
        Migrator::up(db, None).await?;
        info!("Migrations completed successfully");
    }
    Ok(())
}

async fn handle_migrate_command(
    db: &DatabaseConnection,
    action: MigrateAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        MigrateAction::Up => {
            println!("Applying migrations...");
            Migrator::up(db, None).await?;
            println!("All migrations applied successfully");
        }
        MigrateAction::Down => {
            println!("Rolling back last migration...");
            Migrator::down(db, Some(1)).await?;
            println!("Migration rolled back successfully");
        }
        MigrateAction::Status => {
            println!("Checking migration status...");
            let applied = Migrator::get_applied_migrations(db).await?;
            let pending = Migrator::get_pending_migrations(db).await?;

            if applied.is_empty() {
                println!("No migrations have been applied");
            } else {
                println!("Applied migrations: {} migration(s)", applied.len());
            }

            if pending.is_empty() {
                println!("No pending migrations");
            } else {
                println!("Pending migrations: {} migration(s)", pending.len());
            }
        }
    }
    Ok(())
}
