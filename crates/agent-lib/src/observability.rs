//! Structured logging for agent components
//!
//! Every sampler, the writer and the PID driver own a [`StructuredLogger`]
//! handle that stamps the job id and component id onto each event, so
//! JSON log lines from concurrently running tasks can be told apart.

use std::fmt::Display;
use tracing::{debug, error, info, warn};

/// Logging handle scoped to one job and one component
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    job_id: String,
    component: String,
}

impl StructuredLogger {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            component: "agent".to_string(),
        }
    }

    /// Derive a handle for a named component of the same job
    pub fn for_component(&self, component: impl Into<String>) -> Self {
        Self {
            job_id: self.job_id.clone(),
            component: component.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, samplers: &[String], output: &str) {
        info!(
            event = "agent_started",
            job_id = %self.job_id,
            agent_version = %version,
            samplers = ?samplers,
            output = %output,
            "Job agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            job_id = %self.job_id,
            reason = %reason,
            "Job agent shutting down"
        );
    }

    /// A plugin could not be constructed and will not run
    pub fn log_plugin_rejected(&self, plugin: &str, err: &dyn Display) {
        error!(
            event = "plugin_rejected",
            job_id = %self.job_id,
            component = %self.component,
            plugin = %plugin,
            error = %err,
            "Plugin failed to initialize and was skipped"
        );
    }

    /// A sampler hook failed; the sampler keeps running
    pub fn log_sampler_error(&self, stage: &str, err: &anyhow::Error) {
        warn!(
            event = "sampler_error",
            job_id = %self.job_id,
            component = %self.component,
            stage = %stage,
            error = %format!("{err:#}"),
            "Failed to do {stage}"
        );
    }

    /// One measured target of a sampler failed; the rest of the sample is kept
    pub fn log_target_failed(&self, kind: &str, target: &str, err: &anyhow::Error) {
        error!(
            event = "target_failed",
            job_id = %self.job_id,
            component = %self.component,
            kind = %kind,
            name = %target,
            error = %format!("{err:#}"),
            "Failed to read {kind} {target}"
        );
    }

    /// A component task ended abnormally
    pub fn log_task_failed(&self, task: &str, err: &dyn Display) {
        error!(
            event = "task_failed",
            job_id = %self.job_id,
            component = %self.component,
            task = %task,
            error = %err,
            "Task failed"
        );
    }

    pub fn log_pids_received(&self, new_pids: usize, known_pids: usize) {
        debug!(
            event = "pids_received",
            job_id = %self.job_id,
            component = %self.component,
            new_pids = new_pids,
            known_pids = known_pids,
            "Received new pids"
        );
    }

    pub fn log_idle_tick(&self) {
        debug!(
            event = "intake_timeout",
            job_id = %self.job_id,
            component = %self.component,
            "Intake queue empty at interval"
        );
    }

    /// The output queue has no consumer left
    pub fn log_publish_failed(&self, err: &dyn Display) {
        warn!(
            event = "publish_failed",
            job_id = %self.job_id,
            component = %self.component,
            error = %err,
            "Dropping sample, output queue is closed"
        );
    }

    pub fn log_sampler_finished(&self, known_pids: usize) {
        debug!(
            event = "sampler_finished",
            job_id = %self.job_id,
            component = %self.component,
            known_pids = known_pids,
            "Sampler final data consumed"
        );
    }

    /// A mid-stream store/finalize failed; the envelope is dropped
    pub fn log_store_failed(&self, stage: &str, source_id: &str, err: &anyhow::Error) {
        warn!(
            event = "store_failed",
            job_id = %self.job_id,
            component = %self.component,
            stage = %stage,
            source_id = %source_id,
            error = %format!("{err:#}"),
            "Failed to {stage} envelope, dropping it"
        );
    }

    pub fn log_flush_attempt_failed(&self, attempt: u32, max_attempts: u32, err: &anyhow::Error) {
        warn!(
            event = "flush_failed",
            job_id = %self.job_id,
            component = %self.component,
            attempt = attempt,
            max_attempts = max_attempts,
            error = %format!("{err:#}"),
            "Failed to write accumulated data"
        );
    }

    pub fn log_flush_complete(&self, output: &str, attempts: u32) {
        info!(
            event = "flush_complete",
            job_id = %self.job_id,
            component = %self.component,
            output = %output,
            attempts = attempts,
            "Accumulated data written"
        );
    }

    pub fn log_flush_abandoned(&self, attempts: u32) {
        error!(
            event = "flush_abandoned",
            job_id = %self.job_id,
            component = %self.component,
            attempts = attempts,
            "Giving up writing accumulated data"
        );
    }

    pub fn log_pid_batch(&self, new_pids: usize, intakes: usize) {
        debug!(
            event = "pid_batch",
            job_id = %self.job_id,
            component = %self.component,
            new_pids = new_pids,
            intakes = intakes,
            "Forwarding discovered pids"
        );
    }

    pub fn log_job_gone(&self, known_pids: usize) {
        info!(
            event = "job_gone",
            job_id = %self.job_id,
            component = %self.component,
            known_pids = known_pids,
            "No job processes left, closing samplers"
        );
    }
}

/// In-memory JSON log sink for asserting on emitted events
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl CapturedLogs {
    /// Capture events on the current thread until the guard is dropped
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_logger_component_scoping() {
        let logger = StructuredLogger::new("1234");
        assert_eq!(logger.job_id(), "1234");
        assert_eq!(logger.component(), "agent");

        let sampler = logger.for_component("slurm_cgroup");
        assert_eq!(sampler.job_id(), "1234");
        assert_eq!(sampler.component(), "slurm_cgroup");
    }

    #[test]
    fn test_logging_without_subscriber_is_harmless() {
        let logger = StructuredLogger::new("1").for_component("writer");
        logger.log_flush_attempt_failed(1, 3, &anyhow::anyhow!("backend down"));
        logger.log_flush_abandoned(3);
        logger.log_store_failed("store", "slurm_info", &anyhow::anyhow!("bad payload"));
    }

    #[test]
    fn test_events_carry_job_and_component() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();

        let logger = StructuredLogger::new("77").for_component("zfs_stats");
        logger.log_target_failed("volume", "tank/77", &anyhow::anyhow!("zfs exited with 1"));
        logger.log_task_failed("slurm_info", &"task panicked");

        let contents = logs.contents();
        assert_eq!(contents.matches("\"job_id\":\"77\"").count(), 2);
        assert_eq!(contents.matches("\"component\":\"zfs_stats\"").count(), 2);
        assert!(contents.contains("target_failed"));
        assert!(contents.contains("task_failed"));
    }
}
