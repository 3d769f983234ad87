//! Writer: the single consumer of the output queue
//!
//! [`run_writer`] drains envelopes into an [`Output`] until the queue is
//! closed, then flushes the accumulated state with bounded retries. Failures
//! while storing individual envelopes are logged and dropped; only the final
//! flush is retried.

mod backend;

pub use backend::{Backend, FileBackend, HttpBackend};

use crate::config::JobContext;
use crate::error::ConfigError;
use crate::models::{Envelope, JobDocument, WriterState};
use crate::observability::StructuredLogger;
use crate::queue::{OutputMessage, OutputReceiver};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Capability set every writer provides
#[async_trait]
pub trait Output: Send {
    fn id(&self) -> &str;

    /// Record one envelope
    async fn store(&mut self, envelope: &Envelope) -> Result<()>;

    /// Called in addition to `store` for a sampler's FINAL envelope
    async fn finalize(&mut self, envelope: &Envelope) -> Result<()> {
        self.store(envelope).await
    }

    /// Flush everything accumulated so far to the backend
    async fn write(&mut self) -> Result<()>;
}

/// Retry policy for the end-of-run flush
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum number of `write` attempts (default: 3)
    pub retry_count: u32,
    /// Pause between attempts (default: 3 seconds)
    pub retry_sleep: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_sleep: Duration::from_secs(3),
        }
    }
}

impl WriterConfig {
    pub fn from_config(job: &JobContext, output_id: &str) -> Result<Self, ConfigError> {
        let config = job.plugin(output_id);
        let defaults = Self::default();
        let retry_count: u32 = config.get_or("retry_count", defaults.retry_count)?;
        let retry_sleep: f64 =
            config.get_or("retry_sleep", defaults.retry_sleep.as_secs_f64())?;
        if !retry_sleep.is_finite() || retry_sleep < 0.0 {
            return Err(ConfigError::Invalid {
                key: format!("{output_id}.retry_sleep"),
                reason: "must be a non-negative number of seconds".to_string(),
            });
        }
        Ok(Self {
            retry_count,
            retry_sleep: Duration::from_secs_f64(retry_sleep),
        })
    }
}

/// How the end-of-run flush went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed { attempts: u32 },
    Abandoned { attempts: u32 },
}

/// Consume the output queue until it is closed, then flush.
pub async fn run_writer(
    mut output: Box<dyn Output>,
    mut queue: OutputReceiver,
    config: WriterConfig,
    logger: StructuredLogger,
) -> FlushOutcome {
    while let Some(message) = queue.recv().await {
        let envelope = match message {
            OutputMessage::Close => {
                queue.task_done();
                break;
            }
            OutputMessage::Envelope(envelope) => envelope,
        };

        if let Err(e) = output.store(&envelope).await {
            logger.log_store_failed("store", &envelope.source_id, &e);
        }
        if envelope.is_final() {
            if let Err(e) = output.finalize(&envelope).await {
                logger.log_store_failed("finalize", &envelope.source_id, &e);
            }
        }
        queue.task_done();
    }

    // Release samplers still joined on the queue before the possibly slow flush
    drop(queue);

    let mut attempts = 0;
    while attempts < config.retry_count {
        attempts += 1;
        match output.write().await {
            Ok(()) => {
                logger.log_flush_complete(output.id(), attempts);
                return FlushOutcome::Flushed { attempts };
            }
            Err(e) => {
                logger.log_flush_attempt_failed(attempts, config.retry_count, &e);
                if attempts < config.retry_count {
                    tokio::time::sleep(config.retry_sleep).await;
                }
            }
        }
    }

    logger.log_flush_abandoned(attempts);
    FlushOutcome::Abandoned { attempts }
}

/// Writer that keeps the latest payload per source and flushes it to a backend
pub struct AccumulatingOutput {
    id: String,
    job_id: String,
    state: WriterState,
    backend: Box<dyn Backend>,
}

impl AccumulatingOutput {
    pub fn new(id: impl Into<String>, job_id: impl Into<String>, backend: Box<dyn Backend>) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            state: WriterState::new(),
            backend,
        }
    }

    pub fn state(&self) -> &WriterState {
        &self.state
    }

    fn document(&self) -> JobDocument {
        JobDocument {
            job_id: self.job_id.clone(),
            written_at: chrono::Utc::now().timestamp(),
            sources: self.state.clone(),
        }
    }
}

#[async_trait]
impl Output for AccumulatingOutput {
    fn id(&self) -> &str {
        &self.id
    }

    async fn store(&mut self, envelope: &Envelope) -> Result<()> {
        if !envelope.is_final() {
            self.state
                .insert(envelope.source_id.clone(), envelope.payload.clone());
        }
        Ok(())
    }

    /// Merge FINAL keys over the last sample so an empty FINAL keeps it
    async fn finalize(&mut self, envelope: &Envelope) -> Result<()> {
        let entry = self.state.entry(envelope.source_id.clone()).or_default();
        for (key, value) in &envelope.payload {
            entry.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn write(&mut self) -> Result<()> {
        let document = self.document();
        self.backend.write(&document).await?;
        tracing::debug!(output = %self.id, sources = document.sources.len(), "Flushed job document");
        Ok(())
    }
}

/// Construct the writer for an output id
pub fn create_output(id: &str, job: &JobContext) -> Result<Box<dyn Output>, ConfigError> {
    let backend: Box<dyn Backend> = match id {
        backend::FILE_ID => Box::new(FileBackend::from_config(job)?),
        backend::HTTP_ID => Box::new(HttpBackend::from_config(job)?),
        other => return Err(ConfigError::UnknownPlugin(other.to_string())),
    };
    Ok(Box::new(AccumulatingOutput::new(id, job.job_id.clone(), backend)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::models::{EnvelopeKind, Sample};
    use crate::queue::output_queue;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        stored: Vec<String>,
        finalized: Vec<String>,
        writes: u32,
    }

    /// Output failing the first `write_failures` flushes
    struct MockOutput {
        calls: Arc<Mutex<Calls>>,
        write_failures: u32,
        fail_store_for: Option<String>,
    }

    impl MockOutput {
        fn new(write_failures: u32) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            (
                Self {
                    calls: calls.clone(),
                    write_failures,
                    fail_store_for: None,
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl Output for MockOutput {
        fn id(&self) -> &str {
            "mock_output"
        }

        async fn store(&mut self, envelope: &Envelope) -> Result<()> {
            if self.fail_store_for.as_deref() == Some(envelope.source_id.as_str()) {
                anyhow::bail!("store rejected");
            }
            self.calls.lock().unwrap().stored.push(envelope.source_id.clone());
            Ok(())
        }

        async fn finalize(&mut self, envelope: &Envelope) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .finalized
                .push(envelope.source_id.clone());
            Ok(())
        }

        async fn write(&mut self) -> Result<()> {
            let mut calls = self.calls.lock().unwrap();
            calls.writes += 1;
            if calls.writes <= self.write_failures {
                anyhow::bail!("backend unavailable");
            }
            Ok(())
        }
    }

    fn sample(key: &str, value: i64) -> Sample {
        let mut sample = Sample::new();
        sample.insert(key.to_string(), json!(value));
        sample
    }

    fn logger() -> StructuredLogger {
        StructuredLogger::new("1").for_component("writer")
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_succeeds_on_third_attempt() {
        let (output, calls) = MockOutput::new(2);
        let (tx, rx) = output_queue();
        tx.close().unwrap();

        let config = WriterConfig {
            retry_count: 3,
            retry_sleep: Duration::from_secs(3),
        };
        let start = tokio::time::Instant::now();
        let outcome = run_writer(Box::new(output), rx, config, logger()).await;

        assert_eq!(outcome, FlushOutcome::Flushed { attempts: 3 });
        assert_eq!(calls.lock().unwrap().writes, 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_successful_flush_is_logged() {
        let (output, _calls) = MockOutput::new(0);
        let (tx, rx) = output_queue();
        tx.close().unwrap();

        let logs = crate::observability::CapturedLogs::default();
        let _guard = logs.install();
        let outcome = run_writer(Box::new(output), rx, WriterConfig::default(), logger()).await;

        assert_eq!(outcome, FlushOutcome::Flushed { attempts: 1 });
        let line = logs
            .contents()
            .lines()
            .find(|line| line.contains("flush_complete"))
            .map(str::to_string)
            .unwrap();
        assert!(line.contains("\"component\":\"writer\""));
        assert!(line.contains("\"attempts\":1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_is_abandoned_after_retry_count() {
        let (output, calls) = MockOutput::new(u32::MAX);
        let (tx, rx) = output_queue();
        tx.close().unwrap();

        let outcome = run_writer(Box::new(output), rx, WriterConfig::default(), logger()).await;

        assert_eq!(outcome, FlushOutcome::Abandoned { attempts: 3 });
        assert_eq!(calls.lock().unwrap().writes, 3);
    }

    #[tokio::test]
    async fn test_zero_retry_count_never_writes() {
        let (output, calls) = MockOutput::new(0);
        let (tx, rx) = output_queue();
        tx.close().unwrap();

        let config = WriterConfig {
            retry_count: 0,
            retry_sleep: Duration::ZERO,
        };
        let outcome = run_writer(Box::new(output), rx, config, logger()).await;
        assert_eq!(outcome, FlushOutcome::Abandoned { attempts: 0 });
        assert_eq!(calls.lock().unwrap().writes, 0);
    }

    #[tokio::test]
    async fn test_envelopes_before_close_are_processed() {
        let (mut output, calls) = MockOutput::new(0);
        output.fail_store_for = Some("broken".to_string());
        let (tx, rx) = output_queue();

        let a = tx.publisher("a");
        let broken = tx.publisher("broken");
        a.store(sample("x", 1)).unwrap();
        broken.store(sample("x", 2)).unwrap();
        broken.publish(Sample::new(), EnvelopeKind::Final).unwrap();
        a.publish(sample("x", 3), EnvelopeKind::Final).unwrap();
        tx.close().unwrap();

        let outcome = run_writer(Box::new(output), rx, WriterConfig::default(), logger()).await;
        assert_eq!(outcome, FlushOutcome::Flushed { attempts: 1 });

        let calls = calls.lock().unwrap();
        assert_eq!(calls.stored, vec!["a", "a"]);
        // A failed store does not prevent finalize
        assert_eq!(calls.finalized, vec!["broken", "a"]);
        assert_eq!(tx.pending(), 0);
    }

    #[tokio::test]
    async fn test_default_finalize_forwards_to_store() {
        struct StoreOnly(Vec<EnvelopeKind>);

        #[async_trait]
        impl Output for StoreOnly {
            fn id(&self) -> &str {
                "store_only"
            }
            async fn store(&mut self, envelope: &Envelope) -> Result<()> {
                self.0.push(envelope.kind);
                Ok(())
            }
            async fn write(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut output = StoreOnly(Vec::new());
        let envelope = Envelope::new("a", Sample::new(), EnvelopeKind::Final);
        output.finalize(&envelope).await.unwrap();
        assert_eq!(output.0, vec![EnvelopeKind::Final]);
    }

    #[tokio::test]
    async fn test_accumulating_output_keeps_latest_and_merges_final() {
        struct Discard;

        #[async_trait]
        impl Backend for Discard {
            async fn write(&self, _document: &JobDocument) -> Result<()> {
                Ok(())
            }
        }

        let mut output = AccumulatingOutput::new("file_output", "42", Box::new(Discard));

        let first = Envelope::new("slurm_cgroup", sample("memory", 1), EnvelopeKind::Now);
        let second = Envelope::new("slurm_cgroup", sample("memory", 2), EnvelopeKind::Now);
        let empty_final = Envelope::new("slurm_cgroup", Sample::new(), EnvelopeKind::Final);
        let info_final = Envelope::new("slurm_info", sample("cpus", 8), EnvelopeKind::Final);

        for envelope in [&first, &second, &empty_final, &info_final] {
            output.store(envelope).await.unwrap();
            if envelope.is_final() {
                output.finalize(envelope).await.unwrap();
            }
        }

        assert_eq!(output.state()["slurm_cgroup"]["memory"], json!(2));
        assert_eq!(output.state()["slurm_info"]["cpus"], json!(8));
        output.write().await.unwrap();
    }

    #[test]
    fn test_writer_config_from_config() {
        let job = JobContext::new(
            "1",
            JobConfig::from_value(json!({ "file_output": { "retry_count": 5, "retry_sleep": 0.5 } })),
        );
        let config = WriterConfig::from_config(&job, "file_output").unwrap();
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.retry_sleep, Duration::from_millis(500));

        let defaults = WriterConfig::from_config(&job, "http_output").unwrap();
        assert_eq!(defaults.retry_count, 3);
        assert_eq!(defaults.retry_sleep, Duration::from_secs(3));
    }

    #[test]
    fn test_create_unknown_output() {
        let job = JobContext::new("1", JobConfig::default());
        assert!(matches!(
            create_output("xml_output", &job),
            Err(ConfigError::UnknownPlugin(_))
        ));
    }
}
