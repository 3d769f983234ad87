//! Samplers: periodic measurement of one metric source for the job
//!
//! A sampler is a plain struct implementing [`Sampler`]. The framework owns
//! the run loop ([`run_sampler`]): it waits on the sampler's private intake
//! queue for PID batches, gates every tick through [`Sampler::do_sample`],
//! and publishes the sampler's final data exactly once on shutdown.

mod cgroup;
mod command;
mod slurm_info;
mod zfs;


pub use cgroup::{parse_cpu_count, SlurmCgroupSampler};
pub use slurm_info::{JobInfo, SlurmInfoSampler};
pub use zfs::{VolumeUsage, ZfsStatsSampler};

use crate::config::JobContext;
use crate::error::ConfigError;
use crate::models::{EnvelopeKind, IntakeMessage, PidSet, Sample};
use crate::observability::StructuredLogger;
use crate::queue::{OutputSender, Publisher};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default seconds between sampler ticks
pub const DEFAULT_SAMPLER_INTERVAL: u64 = 60;

/// Capability set every sampler provides
#[async_trait]
pub trait Sampler: Send {
    /// Plugin id; also the configuration scope and the envelope source id
    fn id(&self) -> &str;

    /// One-time setup before the loop starts
    async fn init(&mut self, _ctx: &mut SamplerContext) -> Result<()> {
        Ok(())
    }

    /// Whether this tick should sample
    async fn do_sample(&mut self, ctx: &mut SamplerContext) -> Result<bool> {
        Ok(!ctx.pids().is_empty())
    }

    /// Take a measurement and publish zero or one sample through `ctx`
    async fn sample(&mut self, ctx: &mut SamplerContext) -> Result<()>;

    /// Data to publish as the FINAL envelope; called once at shutdown
    async fn final_data(&mut self, ctx: &mut SamplerContext) -> Result<Sample>;
}

/// Sampler-local state owned by the sampler task
pub struct SamplerContext {
    job: JobContext,
    pids: PidSet,
    publisher: Publisher,
    logger: StructuredLogger,
    interval: Duration,
}

impl SamplerContext {
    pub fn new(
        job: JobContext,
        publisher: Publisher,
        logger: StructuredLogger,
        interval: Duration,
    ) -> Self {
        Self {
            job,
            pids: PidSet::new(),
            publisher,
            logger,
            interval,
        }
    }

    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn pids(&self) -> &PidSet {
        &self.pids
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Publish a regular sample; a closed queue is logged, not returned
    pub fn store(&self, sample: Sample) {
        if let Err(e) = self.publisher.store(sample) {
            self.logger.log_publish_failed(&e);
        }
    }
}

/// Sending side of a sampler's intake queue
#[derive(Debug, Clone)]
pub struct IntakeSender {
    sampler_id: String,
    tx: mpsc::UnboundedSender<IntakeMessage>,
}

impl IntakeSender {
    pub fn sampler_id(&self) -> &str {
        &self.sampler_id
    }

    /// Deliver a PID batch; returns false if the sampler has already stopped
    pub fn send_pids(&self, pids: Vec<u32>) -> bool {
        self.tx.send(IntakeMessage::Pids(pids)).is_ok()
    }

    /// Ask the sampler to publish its final data and stop
    pub fn close(&self) -> bool {
        self.tx.send(IntakeMessage::Close).is_ok()
    }
}

pub type IntakeReceiver = mpsc::UnboundedReceiver<IntakeMessage>;

/// Create an intake queue for the named sampler
pub fn intake_queue(sampler_id: impl Into<String>) -> (IntakeSender, IntakeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        IntakeSender {
            sampler_id: sampler_id.into(),
            tx,
        },
        rx,
    )
}

/// Read `sampler_interval` for a sampler id
pub fn sampler_interval(job: &JobContext, id: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = job
        .plugin(id)
        .get_or("sampler_interval", DEFAULT_SAMPLER_INTERVAL as f64)?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::Invalid {
            key: format!("{id}.sampler_interval"),
            reason: "must be a positive number of seconds".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Drive one sampler until its intake queue delivers a close marker.
///
/// Returns the sampler's context once the FINAL envelope has been consumed by
/// the writer.
pub async fn run_sampler(
    mut sampler: Box<dyn Sampler>,
    mut ctx: SamplerContext,
    mut intake: IntakeReceiver,
) -> SamplerContext {
    if let Err(e) = sampler.init(&mut ctx).await {
        ctx.logger.log_sampler_error("init", &e);
    }

    loop {
        match tokio::time::timeout(ctx.interval, intake.recv()).await {
            Err(_elapsed) => ctx.logger.log_idle_tick(),
            Ok(Some(IntakeMessage::Pids(batch))) => {
                let added = ctx.pids.extend(batch);
                ctx.logger.log_pids_received(added, ctx.pids.len());
            }
            // All senders gone means nobody can ever close us; treat it as close
            Ok(Some(IntakeMessage::Close)) | Ok(None) => break,
        }

        match sampler.do_sample(&mut ctx).await {
            Ok(true) => {
                if let Err(e) = sampler.sample(&mut ctx).await {
                    ctx.logger.log_sampler_error("sample", &e);
                }
            }
            Ok(false) => {}
            Err(e) => ctx.logger.log_sampler_error("do_sample", &e),
        }
    }

    match sampler.final_data(&mut ctx).await {
        Ok(data) => {
            if let Err(e) = ctx.publisher.publish(data, EnvelopeKind::Final) {
                ctx.logger.log_publish_failed(&e);
            }
        }
        Err(e) => ctx.logger.log_sampler_error("final_data", &e),
    }

    ctx.publisher.join().await;
    ctx.logger.log_sampler_finished(ctx.pids.len());
    ctx
}

/// Handle to a spawned sampler task
pub struct SamplerHandle {
    pub id: String,
    pub intake: IntakeSender,
    pub task: JoinHandle<SamplerContext>,
}

/// Spawn a sampler task wired to the shared output queue
pub fn spawn_sampler(
    sampler: Box<dyn Sampler>,
    job: JobContext,
    output: &OutputSender,
    logger: &StructuredLogger,
) -> Result<SamplerHandle, ConfigError> {
    let id = sampler.id().to_string();
    let interval = sampler_interval(&job, &id)?;
    let ctx = SamplerContext::new(
        job,
        output.publisher(id.clone()),
        logger.for_component(id.clone()),
        interval,
    );
    let (intake, rx) = intake_queue(id.clone());
    let task = tokio::spawn(run_sampler(sampler, ctx, rx));

    Ok(SamplerHandle { id, intake, task })
}

/// Construct a sampler from its plugin id
pub fn create_sampler(id: &str, job: &JobContext) -> Result<Box<dyn Sampler>, ConfigError> {
    match id {
        cgroup::ID => Ok(Box::new(SlurmCgroupSampler::from_config(job)?)),
        slurm_info::ID => Ok(Box::new(SlurmInfoSampler::from_config(job)?)),
        zfs::ID => Ok(Box::new(ZfsStatsSampler::from_config(job)?)),
        other => Err(ConfigError::UnknownPlugin(other.to_string())),
    }
}
