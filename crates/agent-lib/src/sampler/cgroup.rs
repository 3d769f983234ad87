//! Slurm cgroup v1 accounting sampler
//!
//! Resolves the job's cgroup from any of its processes (`/proc/<pid>/cpuset`)
//! and then reads the cpuset and memory controller files under the cgroup
//! mount on every tick:
//! - cpuset.cpus for the number of allocated cores
//! - memory.usage_in_bytes, memory.limit_in_bytes, memory.max_usage_in_bytes
//! - memory.memsw.usage_in_bytes for swap (memsw minus plain usage)

use super::{Sampler, SamplerContext};
use crate::config::JobContext;
use crate::error::ConfigError;
use crate::models::Sample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tracing::debug;

pub(crate) const ID: &str = "slurm_cgroup";

fn slurm_cgroup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^/(slurm/uid_\d+/job_\d+)/").expect("static regex is valid")
    })
}

/// Sampler reading memory and cpu allocation from the job's cgroup
pub struct SlurmCgroupSampler {
    /// Root of the cgroup v1 controllers (typically /cgroup or /sys/fs/cgroup)
    cgroup_base: PathBuf,
    /// Path to /proc filesystem
    proc_path: PathBuf,
    /// Resolved `slurm/uid_N/job_N`, cached once found
    cgroup: Option<String>,
}

impl SlurmCgroupSampler {
    pub fn new(cgroup_base: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_base: cgroup_base.into(),
            proc_path: PathBuf::from("/proc"),
            cgroup: None,
        }
    }

    /// Create sampler with custom proc path (for testing)
    pub fn with_proc_path(cgroup_base: impl Into<PathBuf>, proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
            ..Self::new(cgroup_base)
        }
    }

    pub fn from_config(job: &JobContext) -> Result<Self, ConfigError> {
        let config = job.plugin(ID);
        let cgroup_base: PathBuf = config.get_or("cgroup_base", PathBuf::from("/cgroup"))?;
        let proc_path: PathBuf = config.get_or("proc_path", PathBuf::from("/proc"))?;
        Ok(Self::with_proc_path(cgroup_base, proc_path))
    }

    pub fn cgroup(&self) -> Option<&str> {
        self.cgroup.as_deref()
    }

    /// Extract `slurm/uid_N/job_N` from the first line of a cpuset file
    pub fn parse_proc_cpuset(content: &str) -> Option<String> {
        let line = content.lines().next()?;
        slurm_cgroup_pattern()
            .captures(line)
            .map(|c| c[1].to_string())
    }

    async fn resolve_cgroup(&mut self, ctx: &SamplerContext) -> bool {
        if self.cgroup.is_some() {
            return true;
        }

        for pid in ctx.pids().iter() {
            let cpuset_file = self.proc_path.join(pid.to_string()).join("cpuset");
            match fs::read_to_string(&cpuset_file).await {
                Ok(content) => {
                    if let Some(cgroup) = Self::parse_proc_cpuset(&content) {
                        debug!(pid = pid, cgroup = %cgroup, "Resolved job cgroup");
                        self.cgroup = Some(cgroup);
                        return true;
                    }
                }
                Err(e) => {
                    debug!(pid = pid, error = %e, "Failed to fetch cpuset for pid");
                }
            }
        }
        false
    }

    fn controller_path(&self, controller: &str, cgroup: &str, file: &str) -> PathBuf {
        self.cgroup_base.join(controller).join(cgroup).join(file)
    }

    /// First line of a cgroup file, or an empty string if it cannot be read
    async fn read_cgroup(path: &Path) -> String {
        match fs::read_to_string(path).await {
            Ok(content) => content.lines().next().unwrap_or_default().trim().to_string(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Failed to open cgroup file for reading");
                String::new()
            }
        }
    }
}

/// Number of cpus described by a cpuset list such as `0-3,8`.
///
/// Only the first comma-separated token is counted: `"0-3"` gives 4, but
/// `"0,2,4"` gives 1. Tokens that are not `N` or `N-M` in plain digits count
/// as 0; numbers too large to count with are an error.
pub fn parse_cpu_count(cpuset: &str) -> Result<i64> {
    let Some(token) = cpuset.split(',').next() else {
        return Ok(0);
    };

    let overflow = || anyhow::anyhow!("cpuset {cpuset:?} out of range");

    if let Some((start, end)) = token.split_once('-') {
        if !is_digits(start) || !is_digits(end) {
            return Ok(0);
        }
        let start: i64 = start.parse().map_err(|_| overflow())?;
        let end: i64 = end.parse().map_err(|_| overflow())?;
        return end
            .checked_sub(start)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(overflow);
    }

    Ok(if is_digits(token) { 1 } else { 0 })
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[async_trait]
impl Sampler for SlurmCgroupSampler {
    fn id(&self) -> &str {
        ID
    }

    async fn do_sample(&mut self, ctx: &mut SamplerContext) -> Result<bool> {
        Ok(self.resolve_cgroup(ctx).await)
    }

    async fn sample(&mut self, ctx: &mut SamplerContext) -> Result<()> {
        let cgroup = self
            .cgroup
            .clone()
            .context("cgroup not resolved yet")?;

        let cpus = Self::read_cgroup(&self.controller_path("cpuset", &cgroup, "cpuset.cpus")).await;
        let memory_usage =
            Self::read_cgroup(&self.controller_path("memory", &cgroup, "memory.usage_in_bytes")).await;
        let memory_limit =
            Self::read_cgroup(&self.controller_path("memory", &cgroup, "memory.limit_in_bytes")).await;
        let memory_max_usage =
            Self::read_cgroup(&self.controller_path("memory", &cgroup, "memory.max_usage_in_bytes"))
                .await;
        let memory_usage_and_swap = Self::read_cgroup(&self.controller_path(
            "memory",
            &cgroup,
            "memory.memsw.usage_in_bytes",
        ))
        .await;

        let memsw: i64 = memory_usage_and_swap
            .parse()
            .with_context(|| format!("invalid memory.memsw.usage_in_bytes {memory_usage_and_swap:?}"))?;
        let usage: i64 = memory_usage
            .parse()
            .with_context(|| format!("invalid memory.usage_in_bytes {memory_usage:?}"))?;
        let swap = memsw
            .checked_sub(usage)
            .with_context(|| format!("swap out of range: {memsw} - {usage}"))?;

        let mut sample = Sample::new();
        sample.insert("cpus".into(), Value::from(parse_cpu_count(&cpus)?));
        sample.insert("memory_usage".into(), Value::from(memory_usage));
        sample.insert("memory_limit".into(), Value::from(memory_limit));
        sample.insert("memory_max_usage".into(), Value::from(memory_max_usage));
        sample.insert("memory_swap".into(), Value::from(swap.to_string()));

        ctx.store(sample);
        Ok(())
    }

    async fn final_data(&mut self, _ctx: &mut SamplerContext) -> Result<Sample> {
        Ok(Sample::new())
    }
}
