//! `chatspan serve` — load config and run the gateway.

use chatspan_config::AppConfig;
use std::path::{Path, PathBuf};
use tracing::info;

pub async fn run(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    model: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.unwrap_or_else(|| PathBuf::from("chatspan.toml"));
    let mut config = AppConfig::load(Path::new(&path))?;

    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(model) = model {
        config.model.name = model;
    }

    info!(
        model = %config.model.name,
        window = config.context.window_capacity,
        store = %config.store.path,
        "Starting chatspan"
    );

    chatspan_gateway::start(config).await
}
