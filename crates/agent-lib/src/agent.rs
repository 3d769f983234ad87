//! Agent orchestration
//!
//! Wires the configured samplers, the writer and the PID driver together for
//! one job and runs them until every sampler has delivered its final data.

use crate::config::JobContext;
use crate::error::ConfigError;
use crate::observability::StructuredLogger;
use crate::output::{create_output, run_writer, FlushOutcome, WriterConfig};
use crate::pidfinder::{create_pid_finder, PidDriver, DEFAULT_PID_FINDER_INTERVAL};
use crate::queue::output_queue;
use crate::sampler::{create_sampler, spawn_sampler, SamplerHandle};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Agent settings from the `agent` config section
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub samplers: Vec<String>,
    pub output: String,
    pub pid_finder: String,
    pub pid_finder_interval: Duration,
}

impl AgentSettings {
    pub fn from_config(job: &JobContext) -> Result<Self, ConfigError> {
        let config = job.plugin("agent");
        let samplers: Vec<String> = config.get_or("samplers", Vec::new())?;
        let output: String = config.get_or("output", "file_output".to_string())?;
        let pid_finder: String = config.get_or("pid_finder", "slurm_pids".to_string())?;
        let interval: f64 =
            config.get_or("pid_finder_interval", DEFAULT_PID_FINDER_INTERVAL as f64)?;
        if !interval.is_finite() || interval <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "agent.pid_finder_interval".to_string(),
                reason: "must be a positive number of seconds".to_string(),
            });
        }

        Ok(Self {
            samplers,
            output,
            pid_finder,
            pid_finder_interval: Duration::from_secs_f64(interval),
        })
    }
}

/// One agent instance for one job
pub struct Agent {
    job: JobContext,
    settings: AgentSettings,
    logger: StructuredLogger,
}

impl Agent {
    pub fn new(job: JobContext, logger: StructuredLogger) -> Result<Self, ConfigError> {
        let settings = AgentSettings::from_config(&job)?;
        Ok(Self {
            job,
            settings,
            logger,
        })
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run until every sampler has finished, then flush the output.
    ///
    /// Samplers stop when the PID driver sees the job exit or when `shutdown`
    /// fires. Output and PID finder construction errors are fatal; a sampler
    /// that cannot be constructed is logged and skipped.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<FlushOutcome> {
        let Self {
            job,
            settings,
            logger,
        } = self;

        let output = create_output(&settings.output, &job)
            .with_context(|| format!("Failed to create output {}", settings.output))?;
        let writer_config = WriterConfig::from_config(&job, &settings.output)?;
        let finder = create_pid_finder(&settings.pid_finder, &job)
            .with_context(|| format!("Failed to create pid finder {}", settings.pid_finder))?;

        let (queue, receiver) = output_queue();
        let writer = tokio::spawn(run_writer(
            output,
            receiver,
            writer_config,
            logger.for_component(settings.output.clone()),
        ));

        let mut samplers: Vec<SamplerHandle> = Vec::new();
        for id in &settings.samplers {
            let spawned = create_sampler(id, &job)
                .and_then(|sampler| spawn_sampler(sampler, job.clone(), &queue, &logger));
            match spawned {
                Ok(handle) => samplers.push(handle),
                Err(e) => logger.log_plugin_rejected(id, &e),
            }
        }

        let running: Vec<String> = samplers.iter().map(|s| s.id.clone()).collect();
        logger.log_startup(AGENT_VERSION, &running, &settings.output);

        let driver = PidDriver::new(
            finder,
            samplers.iter().map(|s| s.intake.clone()).collect(),
            settings.pid_finder_interval,
            logger.for_component(settings.pid_finder.clone()),
        );
        let driver = tokio::spawn(driver.run(shutdown));

        for handle in samplers {
            // The handle's intake sender must go before awaiting, or a dead driver
            // would leave the sampler waiting forever
            let SamplerHandle { id, intake, task } = handle;
            drop(intake);
            if let Err(e) = task.await {
                logger.log_task_failed(&id, &e);
            }
        }
        info!(job_id = %job.job_id, "All samplers finished");

        // Nothing left to feed; the driver may still be polling if no sampler ran
        driver.abort();
        let _ = driver.await;

        queue
            .close()
            .context("Writer stopped before the output queue was closed")?;
        let outcome = writer.await.context("Writer task failed")?;

        logger.log_shutdown(match outcome {
            FlushOutcome::Flushed { .. } => "flushed",
            FlushOutcome::Abandoned { .. } => "flush abandoned",
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::models::JobDocument;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_job_process(proc_dir: &Path, pid: u32, job_id: &str) {
        let dir = proc_dir.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("cpuset"),
            format!("/slurm/uid_1001/job_{job_id}/step_0\n"),
        )
        .unwrap();
    }

    fn write_fake_zfs(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("zfs");
        std::fs::write(&path, "#!/bin/sh\nprintf '1024\\t3072\\n'\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_agent_settings_defaults() {
        let job = JobContext::new("42", JobConfig::default());
        let settings = AgentSettings::from_config(&job).unwrap();
        assert!(settings.samplers.is_empty());
        assert_eq!(settings.output, "file_output");
        assert_eq!(settings.pid_finder, "slurm_pids");
        assert_eq!(settings.pid_finder_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_agent_rejects_bad_pid_finder_interval() {
        let job = JobContext::new(
            "42",
            JobConfig::from_value(json!({ "agent": { "pid_finder_interval": -1 } })),
        );
        assert!(matches!(
            Agent::new(job, StructuredLogger::new("42")),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_job_exit_flushes_accumulated_document() {
        let dir = TempDir::new().unwrap();
        let proc_dir = dir.path().join("proc");
        write_job_process(&proc_dir, 100, "42");
        let zfs = write_fake_zfs(dir.path());
        let out = dir.path().join("job-42.json");

        let job = JobContext::new(
            "42",
            JobConfig::from_value(json!({
                "agent": {
                    "samplers": ["zfs_stats", "no_such_sampler"],
                    "pid_finder_interval": 0.05
                },
                "slurm_pids": { "proc_path": proc_dir },
                "zfs_stats": {
                    "volumes": ["tank/job-{jobid}"],
                    "zfs_command": zfs,
                    "sampler_interval": 0.05
                },
                "file_output": { "path": dir.path().join("job-{jobid}.json") }
            })),
        );

        let agent = Agent::new(job, StructuredLogger::new("42")).unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let run = tokio::spawn(agent.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::remove_dir_all(proc_dir.join("100")).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, FlushOutcome::Flushed { attempts: 1 });

        let document: JobDocument =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(document.job_id, "42");
        assert_eq!(
            document.sources["zfs_stats"]["tank/job-42"],
            json!({ "size": 4096, "free": 3072, "used": 1024 })
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_samplers_before_any_pid() {
        let dir = TempDir::new().unwrap();
        let proc_dir = dir.path().join("proc");
        std::fs::create_dir_all(&proc_dir).unwrap();

        let job = JobContext::new(
            "7",
            JobConfig::from_value(json!({
                "agent": { "samplers": ["slurm_cgroup"], "pid_finder_interval": 0.05 },
                "slurm_pids": { "proc_path": proc_dir },
                "slurm_cgroup": { "proc_path": proc_dir, "cgroup_base": dir.path() },
                "file_output": { "path": dir.path().join("out.json") }
            })),
        );

        let agent = Agent::new(job, StructuredLogger::new("7")).unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let run = tokio::spawn(agent.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, FlushOutcome::Flushed { attempts: 1 });

        let document: JobDocument =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("out.json")).unwrap())
                .unwrap();
        assert_eq!(document.sources["slurm_cgroup"], serde_json::Map::new());
    }

    #[tokio::test]
    async fn test_unknown_output_is_fatal() {
        let job = JobContext::new(
            "1",
            JobConfig::from_value(json!({ "agent": { "output": "xml_output" } })),
        );
        let agent = Agent::new(job, StructuredLogger::new("1")).unwrap();
        let (_tx, rx) = broadcast::channel(1);
        assert!(agent.run(rx).await.is_err());
    }
}
