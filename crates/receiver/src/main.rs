//! Upload Receiver - stores job accounting documents posted by job agents

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use upload_receiver::{serve, AppState, ReceiverConfig};

/// HTTP receiver for job accounting uploads
#[derive(Debug, Parser)]
#[command(name = "upload-receiver")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "UPLOAD_RECEIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(fmt::layer().json())
        .init();

    let config = ReceiverConfig::load(cli.config.as_deref())?;
    let state = Arc::new(AppState::from_config(&config));

    serve(&config, state).await
}
