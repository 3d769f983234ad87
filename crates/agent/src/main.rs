//! Job Agent - per-job resource accounting
//!
//! Started alongside a batch job, this binary samples the job's resource
//! usage until its processes are gone (or it is signalled) and then flushes
//! the accumulated data to the configured output.

use agent_lib::{Agent, FlushOutcome, StructuredLogger};
use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(fmt::layer().json())
        .init();

    let job = cli.job_context()?;
    info!(job_id = %job.job_id, config = %cli.config.display(), "Starting job-agent");

    let logger = StructuredLogger::new(job.job_id.clone());
    let agent = Agent::new(job, logger.clone())?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let reason = shutdown_signal().await;
        logger.log_shutdown(reason);
        let _ = shutdown_tx.send(());
        // Keep the sender alive so receivers never observe a closed channel early
        std::future::pending::<()>().await;
    });

    match agent.run(shutdown_rx).await? {
        FlushOutcome::Flushed { attempts } => {
            info!(attempts, "Job data written");
            Ok(())
        }
        FlushOutcome::Abandoned { attempts } => {
            anyhow::bail!("Failed to write job data after {attempts} attempts")
        }
    }
}

/// Resolve on SIGINT or SIGTERM; a handler that cannot be installed never fires
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
