//! Core data models for the job accounting agent

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One sampler tick's worth of data; the schema is sampler specific
pub type Sample = Map<String, Value>;

/// Whether an envelope is a regular observation or a sampler's last word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Now,
    Final,
}

/// Unit placed on the shared output queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub source_id: String,
    pub payload: Sample,
    pub kind: EnvelopeKind,
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(source_id: impl Into<String>, payload: Sample, kind: EnvelopeKind) -> Self {
        Self {
            source_id: source_id.into(),
            payload,
            kind,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == EnvelopeKind::Final
    }
}

/// Message delivered on a sampler's intake queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeMessage {
    /// Newly discovered process ids belonging to the job
    Pids(Vec<u32>),
    /// The job is gone, stop sampling
    Close,
}

/// Process ids known to a sampler.
///
/// Only ever grows; duplicates are ignored and discovery order is kept so the
/// first PID seen is also the first one tried during cgroup resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidSet {
    pids: Vec<u32>,
}

impl PidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch, returning how many PIDs were new
    pub fn extend(&mut self, batch: impl IntoIterator<Item = u32>) -> usize {
        let before = self.pids.len();
        for pid in batch {
            if !self.pids.contains(&pid) {
                self.pids.push(pid);
            }
        }
        self.pids.len() - before
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Latest payload per source, owned by the writer task
pub type WriterState = BTreeMap<String, Sample>;

/// Document handed to a backend on flush
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    pub job_id: String,
    pub written_at: i64,
    pub sources: WriterState,
}
