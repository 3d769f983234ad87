//! PID discovery
//!
//! A [`PidFinder`] lists the processes currently belonging to the job. The
//! [`PidDriver`] polls it on a fixed interval, forwards newly seen PIDs to
//! every sampler intake, and closes all intakes once the job is gone or an
//! external shutdown arrives.

use crate::config::JobContext;
use crate::error::ConfigError;
use crate::models::PidSet;
use crate::observability::StructuredLogger;
use crate::sampler::IntakeSender;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

pub(crate) const SLURM_PIDS_ID: &str = "slurm_pids";

/// Default seconds between PID scans
pub const DEFAULT_PID_FINDER_INTERVAL: u64 = 30;

/// Source of the job's current process list
#[async_trait]
pub trait PidFinder: Send {
    fn id(&self) -> &str;

    /// PIDs belonging to the job right now; empty once the job has exited
    async fn find(&mut self) -> Result<Vec<u32>>;
}

/// Finds job processes by their Slurm cpuset cgroup
pub struct SlurmPidFinder {
    proc_path: PathBuf,
    pattern: Regex,
}

impl SlurmPidFinder {
    pub fn new(proc_path: impl Into<PathBuf>, job_id: &str) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&format!(r"^/slurm/uid_\d+/job_{}/", regex::escape(job_id)))
            .map_err(|e| ConfigError::Invalid {
                key: "options.jobid".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            proc_path: proc_path.into(),
            pattern,
        })
    }

    pub fn from_config(job: &JobContext) -> Result<Self, ConfigError> {
        let proc_path: PathBuf = job
            .plugin(SLURM_PIDS_ID)
            .get_or("proc_path", PathBuf::from("/proc"))?;
        Self::new(proc_path, &job.job_id)
    }
}

#[async_trait]
impl PidFinder for SlurmPidFinder {
    fn id(&self) -> &str {
        SLURM_PIDS_ID
    }

    async fn find(&mut self) -> Result<Vec<u32>> {
        let mut entries = fs::read_dir(&self.proc_path)
            .await
            .with_context(|| format!("Failed to list {}", self.proc_path.display()))?;

        let mut pids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            // Processes can exit between listing and reading
            let Ok(cpuset) = fs::read_to_string(entry.path().join("cpuset")).await else {
                continue;
            };

            if self.pattern.is_match(cpuset.trim()) {
                pids.push(pid);
            }
        }

        pids.sort_unstable();
        Ok(pids)
    }
}

/// Construct a PID finder from its plugin id
pub fn create_pid_finder(id: &str, job: &JobContext) -> Result<Box<dyn PidFinder>, ConfigError> {
    match id {
        SLURM_PIDS_ID => Ok(Box::new(SlurmPidFinder::from_config(job)?)),
        other => Err(ConfigError::UnknownPlugin(other.to_string())),
    }
}

/// Polls a [`PidFinder`] and feeds every sampler intake
pub struct PidDriver {
    finder: Box<dyn PidFinder>,
    intakes: Vec<IntakeSender>,
    interval: Duration,
    logger: StructuredLogger,
    /// Every PID already forwarded
    forwarded: PidSet,
    closed: bool,
}

impl PidDriver {
    pub fn new(
        finder: Box<dyn PidFinder>,
        intakes: Vec<IntakeSender>,
        interval: Duration,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            finder,
            intakes,
            interval,
            logger,
            forwarded: PidSet::new(),
            closed: false,
        }
    }

    pub fn forwarded(&self) -> &PidSet {
        &self.forwarded
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run until the job is gone or shutdown is signalled; intakes are closed either way
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Self {
        info!(
            finder = %self.finder.id(),
            interval_secs = self.interval.as_secs_f64(),
            samplers = self.intakes.len(),
            "Starting pid discovery"
        );

        let mut ticker = interval(self.interval);

        while !self.closed {
            tokio::select! {
                _ = ticker.tick() => self.poll().await,
                // A dropped shutdown sender counts as shutdown
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown signal");
                    self.close_all();
                }
            }
        }

        self
    }

    /// One discovery pass
    pub async fn poll(&mut self) {
        if self.closed {
            return;
        }

        let found = match self.finder.find().await {
            Ok(found) => found,
            Err(e) => {
                self.logger.log_sampler_error("find", &e);
                return;
            }
        };

        if found.is_empty() {
            if !self.forwarded.is_empty() {
                self.logger.log_job_gone(self.forwarded.len());
                self.close_all();
            }
            return;
        }

        let new: Vec<u32> = found
            .into_iter()
            .filter(|pid| !self.forwarded.contains(*pid))
            .collect();
        if new.is_empty() {
            return;
        }

        self.forwarded.extend(new.iter().copied());
        self.logger.log_pid_batch(new.len(), self.intakes.len());
        for intake in &self.intakes {
            if !intake.send_pids(new.clone()) {
                debug!(sampler = %intake.sampler_id(), "Sampler already stopped, batch dropped");
            }
        }
    }

    /// Send the close marker to every intake, at most once
    pub fn close_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for intake in &self.intakes {
            intake.close();
        }
    }
}
