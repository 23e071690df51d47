//! chatspan CLI — the main entry point.
//!
//! Commands:
//! - `serve` — Start the HTTP gateway with the configured local model
//! - `init`  — Write a default `chatspan.toml`

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "chatspan",
    about = "chatspan — conversational front-end for local text-generation models",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Config file path (default: ./chatspan.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the model alias or GGUF path
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Where to write the config (default: ./chatspan.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            config,
            port,
            model,
        } => commands::serve::run(config, port, model).await?,
        Commands::Init { path, force } => commands::init::run(path, force)?,
    }

    Ok(())
}
