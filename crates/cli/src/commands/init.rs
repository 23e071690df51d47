//! `chatspan init` — write a default configuration file.

use chatspan_config::AppConfig;
use std::path::PathBuf;
use tracing::info;

pub fn run(path: Option<PathBuf>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = path.unwrap_or_else(|| PathBuf::from("chatspan.toml"));

    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    std::fs::write(&path, AppConfig::default().to_toml())?;
    info!(path = %path.display(), "Wrote default configuration");
    println!("Created {}", path.display());
    Ok(())
}
