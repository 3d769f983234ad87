//! Slurm job metadata sampler
//!
//! Polls `scontrol show job <id> -o` until the static job metadata (account,
//! user, node and cpu counts, start time) is complete, then stops polling.

use super::command::first_line;
use super::{Sampler, SamplerContext};
use crate::config::JobContext;
use crate::error::ConfigError;
use crate::models::Sample;
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

pub(crate) const ID: &str = "slurm_info";

struct JobInfoPatterns {
    account: Regex,
    user: Regex,
    nodes: Regex,
    cpus: Regex,
    start_time: Regex,
}

fn patterns() -> &'static JobInfoPatterns {
    static PATTERNS: OnceLock<JobInfoPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| JobInfoPatterns {
        account: Regex::new(r"Account=([^ ]+)").expect("static regex is valid"),
        user: Regex::new(r"UserId=([^(]+)\((\d+)\)").expect("static regex is valid"),
        nodes: Regex::new(r"NumNodes=(\d+)").expect("static regex is valid"),
        cpus: Regex::new(r"NumCPUs=(\d+)").expect("static regex is valid"),
        start_time: Regex::new(r"StartTime=(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})")
            .expect("static regex is valid"),
    })
}

/// Static job metadata as reported by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starttime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl JobInfo {
    /// Parse whatever fields are present in a one-line `scontrol -o` record
    pub fn parse(line: &str) -> Self {
        let p = patterns();
        let capture = |re: &Regex, group: usize| {
            re.captures(line)
                .and_then(|c| c.get(group))
                .map(|m| m.as_str().to_string())
        };

        Self {
            account: capture(&p.account, 1),
            cpus: capture(&p.cpus, 1),
            nodes: capture(&p.nodes, 1),
            starttime: capture(&p.start_time, 1),
            username: capture(&p.user, 1),
            uid: capture(&p.user, 2),
        }
    }

    /// Fill in fields from `other`; fields already set are overwritten only by new values
    pub fn merge(&mut self, other: JobInfo) {
        fn take(dst: &mut Option<String>, src: Option<String>) {
            if src.is_some() {
                *dst = src;
            }
        }
        take(&mut self.account, other.account);
        take(&mut self.cpus, other.cpus);
        take(&mut self.nodes, other.nodes);
        take(&mut self.starttime, other.starttime);
        take(&mut self.username, other.username);
        take(&mut self.uid, other.uid);
    }

    pub fn is_complete(&self) -> bool {
        self.account.is_some()
            && self.cpus.is_some()
            && self.nodes.is_some()
            && self.starttime.is_some()
            && self.username.is_some()
            && self.uid.is_some()
    }

    pub fn to_sample(&self) -> Sample {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Sample::new(),
        }
    }
}

/// Sampler collecting job metadata from `scontrol`
pub struct SlurmInfoSampler {
    scontrol: PathBuf,
    environment: HashMap<String, String>,
    info: JobInfo,
}

impl SlurmInfoSampler {
    pub fn new(scontrol: impl Into<PathBuf>, environment: HashMap<String, String>) -> Self {
        Self {
            scontrol: scontrol.into(),
            environment,
            info: JobInfo::default(),
        }
    }

    pub fn from_config(job: &JobContext) -> Result<Self, ConfigError> {
        let config = job.plugin(ID);
        let scontrol: PathBuf = config.get_or("scontrol", PathBuf::from("/usr/bin/scontrol"))?;
        let environment: HashMap<String, String> = config.get_or("environment", HashMap::new())?;
        Ok(Self::new(scontrol, environment))
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }
}

#[async_trait]
impl Sampler for SlurmInfoSampler {
    fn id(&self) -> &str {
        ID
    }

    async fn init(&mut self, ctx: &mut SamplerContext) -> Result<()> {
        self.sample(ctx).await
    }

    async fn do_sample(&mut self, _ctx: &mut SamplerContext) -> Result<bool> {
        Ok(!self.info.is_complete())
    }

    async fn sample(&mut self, ctx: &mut SamplerContext) -> Result<()> {
        let scontrol = self.scontrol.to_string_lossy();
        let line = match first_line(
            &scontrol,
            &["show", "job", ctx.job_id(), "-o"],
            &self.environment,
        )
        .await
        {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "scontrol failed, will try again next tick");
                return Err(e.into());
            }
        };

        self.info.merge(JobInfo::parse(&line));

        if self.info.is_complete() {
            ctx.store(self.info.to_sample());
        }
        Ok(())
    }

    async fn final_data(&mut self, _ctx: &mut SamplerContext) -> Result<Sample> {
        Ok(self.info.to_sample())
    }
}
