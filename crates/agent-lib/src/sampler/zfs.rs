//! ZFS volume usage sampler
//!
//! Reports size/free/used for a fixed set of per-job volumes using
//! `zfs list -Hp -o used,avail <volume>`.

use super::command::first_line;
use super::{Sampler, SamplerContext};
use crate::config::JobContext;
use crate::error::ConfigError;
use crate::models::Sample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub(crate) const ID: &str = "zfs_stats";

/// Usage of one volume in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub size: u64,
    pub free: u64,
    pub used: u64,
}

impl VolumeUsage {
    /// Parse the `used avail` line printed by `zfs list -Hp`
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let used: u64 = fields
            .next()
            .context("missing used field")?
            .parse()
            .context("invalid used field")?;
        let avail: u64 = fields
            .next()
            .context("missing avail field")?
            .parse()
            .context("invalid avail field")?;

        let size = used
            .checked_add(avail)
            .with_context(|| format!("volume size out of range: {used} + {avail}"))?;

        Ok(Self {
            size,
            free: avail,
            used,
        })
    }
}

/// Sampler reporting per-job ZFS volume usage
pub struct ZfsStatsSampler {
    zfs_command: PathBuf,
    volumes: Vec<String>,
}

impl ZfsStatsSampler {
    /// Create a sampler for already expanded volume names
    pub fn new(zfs_command: impl Into<PathBuf>, volumes: Vec<String>) -> Result<Self, ConfigError> {
        if volumes.is_empty() {
            return Err(ConfigError::Missing(format!("{ID}.volumes")));
        }
        Ok(Self {
            zfs_command: zfs_command.into(),
            volumes,
        })
    }

    pub fn from_config(job: &JobContext) -> Result<Self, ConfigError> {
        let config = job.plugin(ID);
        let templates: Vec<String> = config.get_or("volumes", Vec::new())?;
        let zfs_command: PathBuf = config.get_or("zfs_command", PathBuf::from("/sbin/zfs"))?;
        let volumes = templates.iter().map(|t| job.expand(t)).collect();
        Self::new(zfs_command, volumes)
    }

    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    async fn volume_usage(&self, volume: &str) -> Result<VolumeUsage> {
        let command = self.zfs_command.to_string_lossy();
        let line = first_line(
            &command,
            &["list", "-Hp", "-o", "used,avail", volume],
            &HashMap::new(),
        )
        .await?;
        VolumeUsage::parse(&line).with_context(|| format!("unexpected zfs output {line:?}"))
    }
}

#[async_trait]
impl Sampler for ZfsStatsSampler {
    fn id(&self) -> &str {
        ID
    }

    async fn do_sample(&mut self, _ctx: &mut SamplerContext) -> Result<bool> {
        Ok(true)
    }

    async fn sample(&mut self, ctx: &mut SamplerContext) -> Result<()> {
        let mut sample = Sample::new();

        for volume in &self.volumes {
            match self.volume_usage(volume).await {
                Ok(usage) => {
                    sample.insert(volume.clone(), serde_json::to_value(usage)?);
                }
                Err(e) => {
                    ctx.logger().log_target_failed("volume", volume, &e);
                }
            }
        }

        ctx.store(sample);
        Ok(())
    }

    async fn final_data(&mut self, _ctx: &mut SamplerContext) -> Result<Sample> {
        Ok(Sample::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use serde_json::json;

    #[test]
    fn test_parse_usage_line() {
        let usage = VolumeUsage::parse("1024\t4096").unwrap();
        assert_eq!(
            usage,
            VolumeUsage {
                size: 5120,
                free: 4096,
                used: 1024
            }
        );
    }

    #[test]
    fn test_parse_rejects_size_overflow() {
        let line = format!("{}\t1", u64::MAX);
        assert!(VolumeUsage::parse(&line).is_err());
    }

    #[test]
    fn test_parse_rejects_short_or_garbage_lines() {
        assert!(VolumeUsage::parse("1024").is_err());
        assert!(VolumeUsage::parse("used avail").is_err());
        assert!(VolumeUsage::parse("").is_err());
    }

    #[test]
    fn test_volume_templates_are_expanded() {
        let job = JobContext::new(
            "777",
            JobConfig::from_value(json!({
                "zfs_stats": { "volumes": ["local/tmp.%(jobid)s", "scratch/{jobid}"] }
            })),
        );
        let sampler = ZfsStatsSampler::from_config(&job).unwrap();
        assert_eq!(sampler.volumes(), ["local/tmp.777", "scratch/777"]);
    }

    #[test]
    fn test_no_volumes_is_a_configuration_error() {
        let job = JobContext::new("1", JobConfig::default());
        assert!(matches!(
            ZfsStatsSampler::from_config(&job),
            Err(ConfigError::Missing(_))
        ));

        let job = JobContext::new(
            "1",
            JobConfig::from_value(json!({ "zfs_stats": { "volumes": [] } })),
        );
        assert!(ZfsStatsSampler::from_config(&job).is_err());
    }
}
