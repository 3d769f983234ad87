//! Agent library for per-job resource accounting
//!
//! This crate provides the core functionality for:
//! - Samplers reading job metrics (cgroup, scheduler metadata, ZFS volumes)
//! - The shared output queue and the writer flushing accumulated data
//! - PID discovery feeding samplers and ending the job
//! - Hierarchical configuration and structured logging

pub mod agent;
pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod output;
pub mod pidfinder;
pub mod queue;
pub mod sampler;

pub use agent::{Agent, AgentSettings};
pub use config::{JobConfig, JobContext};
pub use error::{CommandError, ConfigError, QueueClosed};
pub use models::*;
pub use observability::StructuredLogger;
pub use output::FlushOutcome;
