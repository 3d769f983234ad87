//! Receiver configuration

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix for environment overrides, e.g. `UPLOAD_RECEIVER__RECEIVER__BASE_PATH`
pub const ENV_PREFIX: &str = "UPLOAD_RECEIVER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("jobid_hash_size must be greater than zero")]
    ZeroHashSize,
}

/// Settings from the `receiver` section
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// Directory uploads are stored under
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Spread uploads over `<jobid / hash_size>` subdirectories
    #[serde(default)]
    pub jobid_hash_size: Option<u64>,

    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            jobid_hash_size: None,
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    receiver: ReceiverConfig,
}

impl ReceiverConfig {
    /// Load from an optional file layered with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let file: FileConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        file.receiver.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.jobid_hash_size == Some(0) {
            return Err(ConfigError::ZeroHashSize);
        }
        Ok(self)
    }
}
