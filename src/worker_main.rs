//! Cartela worker binary: room managers, scheduling, and the number caller.

use cartela::config::ConfigLoader;
use cartela::errors::GameError;
use cartela::manager::{run_dispatcher, GameManager};
use cartela::postgres::PostgresServices;
use cartela::store::{RedisStore, StateStore};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cartela-worker")]
#[command(about = "Cartela game worker", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Limit this worker to a subset of stakes (comma-separated)
    #[arg(long)]
    stakes: Option<String>,
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

    let stakes: Vec<u32> = match &args.stakes {
        Some(raw) => {
            let mut parsed = Vec::new();
            for part in raw.split(',') {
                let part = part.trim();
                let stake: u32 = part
                    .parse()
                    .map_err(|_| GameError::InvalidStake(part.to_string()))?;
                if !config.game.stakes.contains(&stake) {
                    return Err(GameError::InvalidStake(stake.to_string()).into());
                }
                parsed.push(stake);
            }
            parsed
        }
        None => config.game.stakes.clone(),
    };
    if stakes.is_empty() {
        return Err("no valid stakes to serve".into());
    }

    let store: Arc<dyn StateStore> = Arc::new(RedisStore::connect(&config.store.url).await?);
    let db = PostgresServices::connect(&config.database).await?;
    let services = db.services();

    let mut managers = HashMap::new();
    for &stake in &stakes {
        let manager = GameManager::new(
            Arc::clone(&store),
            services.clone(),
            config.game.clone(),
            stake,
        );
        // Resume rounds left pending by a previous worker.
        if let Err(e) = manager.resume().await {
            warn!(stake, error = %e, "startup resume failed");
        }
        managers.insert(stake.to_string(), manager);
    }
    info!(stakes = ?stakes, "worker serving rooms");

    run_dispatcher(store, managers).await?;
    Ok(())
}
