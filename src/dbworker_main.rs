//! Cartela dbworker binary: persists settlement events to Postgres.

use cartela::config::ConfigLoader;
use cartela::persistence::run_persistence;
use cartela::postgres::PostgresServices;
use cartela::store::{RedisStore, StateStore};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cartela-dbworker")]
#[command(about = "Cartela settlement persistence worker", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Run database migrations before consuming events
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let config = loader.load()?;

    let db = PostgresServices::connect(&config.database).await?;
    if args.migrate {
        db.run_migrations().await?;
        info!("migrations applied");
    }

    let store: Arc<dyn StateStore> = Arc::new(RedisStore::connect(&config.store.url).await?);
    run_persistence(store, db.services()).await?;
    Ok(())
}
