//! Cartela gateway binary: WebSocket front door.

use cartela::config::ConfigLoader;
use cartela::gateway::run_gateway;
use cartela::store::{RedisStore, StateStore};
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "cartela-gateway")]
#[command(about = "Cartela WebSocket gateway", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
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
    let mut config = loader.load()?;
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    let store: Arc<dyn StateStore> = Arc::new(RedisStore::connect(&config.store.url).await?);
    run_gateway(store, config).await?;
    Ok(())
}
