//! Error types shared across the agent library

use thiserror::Error;

/// Configuration problems, raised when a plugin is constructed
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("missing required configuration key {0}")]
    Missing(String),

    #[error("invalid value for configuration key {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("unknown plugin id {0}")]
    UnknownPlugin(String),
}

/// Failure invoking an external command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    Exit { command: String, status: std::process::ExitStatus },

    #[error("{command} produced no output")]
    NoOutput { command: String },
}

/// The consumer side of a queue is gone
#[derive(Debug, Error)]
#[error("queue consumer has shut down")]
pub struct QueueClosed;
