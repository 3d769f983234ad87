//! Command line and configuration loading

use agent_lib::{JobConfig, JobContext};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Per-job resource accounting agent
#[derive(Debug, Parser)]
#[command(name = "job-agent")]
#[command(author, version, about = "Per-job resource accounting agent", long_about = None)]
pub struct Cli {
    /// Job id to account for (set by Slurm in the job environment)
    #[arg(long, env = "SLURM_JOB_ID")]
    pub jobid: String,

    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "JOB_AGENT_CONFIG", default_value = "/etc/job-agent/config.yaml")]
    pub config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Load the configuration file and bind it to the job
    pub fn job_context(&self) -> Result<JobContext> {
        let jobid = self.jobid.trim();
        if jobid.is_empty() {
            anyhow::bail!("Job id must not be empty");
        }

        let config = JobConfig::load(&self.config)
            .with_context(|| format!("Failed to load {}", self.config.display()))?;
        Ok(JobContext::new(jobid, config))
    }
}
