// Canopy engine binary: load configuration, start the worker, report health, exit.

use std::path::PathBuf;
use std::sync::Arc;

use canopy::{EngineConfig, EngineHandle, EngineState};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;

    let level: tracing::Level = config.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let state = Arc::new(EngineState::new(config).await?);
    let handle = EngineHandle::spawn(state).await;
    let (client, _events) = handle.connect();

    match client.request("engine.stats", json!({})).await {
        Ok(stats) => tracing::info!(%stats, "engine ready"),
        Err(outcome) => tracing::error!(?outcome, "engine health check failed"),
    }

    drop(client);
    handle.shutdown().await;
    Ok(())
}
