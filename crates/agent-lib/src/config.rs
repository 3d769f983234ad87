//! Hierarchical job configuration
//!
//! Configuration files are loaded through the `config` crate and flattened
//! into a JSON tree so plugin ids (which may contain dots) can be used as
//! plain keys. Lookups take a key path plus a default, the way every plugin
//! reads its settings.

use crate::error::ConfigError;
use config::Source;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Prefix for environment overrides, e.g. `JOB_AGENT__SLURM_CGROUP__CGROUP_BASE`
pub const ENV_PREFIX: &str = "JOB_AGENT";

/// Configuration tree for one agent instance
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    root: Value,
}

impl JobConfig {
    /// Wrap an already-built JSON tree
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Load a configuration file layered with environment overrides.
    ///
    /// File keys are kept exactly as written; only environment overrides go
    /// through the `config` crate's lowercased key paths.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut root = Map::new();
        for (key, value) in config::File::from(path).collect()? {
            root.insert(key, value.try_deserialize::<Value>()?);
        }
        let mut root = Value::Object(root);

        let overrides: Value = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        merge(&mut root, overrides);

        Ok(Self::from_value(root))
    }

    /// Raw lookup of a key path
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(&self.root, |node, key| node.as_object()?.get(*key))
            .filter(|v| !v.is_null())
    }

    /// Typed lookup; `Ok(None)` when the key is absent
    pub fn get<T: DeserializeOwned>(&self, path: &[&str]) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.lookup(path) else {
            return Ok(None);
        };

        match serde_json::from_value::<T>(value.clone()) {
            Ok(v) => Ok(Some(v)),
            Err(first) => {
                // Environment overrides always arrive as strings
                if let Value::String(s) = value {
                    if let Ok(v) = serde_json::from_str::<T>(s) {
                        return Ok(Some(v));
                    }
                }
                Err(ConfigError::Invalid {
                    key: path.join("."),
                    reason: first.to_string(),
                })
            }
        }
    }

    /// Typed lookup falling back to `default` when the key is absent
    pub fn get_or<T: DeserializeOwned>(&self, path: &[&str], default: T) -> Result<T, ConfigError> {
        Ok(self.get(path)?.unwrap_or(default))
    }

    /// Typed lookup for a key that must be present
    pub fn require<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T, ConfigError> {
        self.get(path)?
            .ok_or_else(|| ConfigError::Missing(path.join(".")))
    }

    /// Set a value, creating intermediate tables as needed
    pub fn set(&mut self, path: &[&str], value: Value) {
        let mut node = &mut self.root;
        for key in path {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return;
            };
            node = map.entry(key.to_string()).or_insert(Value::Null);
        }
        *node = value;
    }

    /// View scoped to one plugin's section
    pub fn plugin<'a>(&'a self, id: &'a str) -> PluginConfig<'a> {
        PluginConfig { config: self, id }
    }
}

/// Lookups relative to a plugin id
#[derive(Debug, Clone, Copy)]
pub struct PluginConfig<'a> {
    config: &'a JobConfig,
    id: &'a str,
}

impl<'a> PluginConfig<'a> {
    pub fn id(&self) -> &'a str {
        self.id
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.config.get(&[self.id, key])
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.config.get_or(&[self.id, key], default)
    }

    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.config.require(&[self.id, key])
    }
}

/// Deep-merge `overlay` into `base`; non-table values replace
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Immutable per-job context shared by every component
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub config: Arc<JobConfig>,
}

impl JobContext {
    /// Build a context, recording the job id under `options.jobid`
    pub fn new(job_id: impl Into<String>, mut config: JobConfig) -> Self {
        let job_id = job_id.into();
        config.set(&["options", "jobid"], Value::String(job_id.clone()));
        Self {
            job_id,
            config: Arc::new(config),
        }
    }

    pub fn plugin<'a>(&'a self, id: &'a str) -> PluginConfig<'a> {
        self.config.plugin(id)
    }

    /// Substitute the job id into a template (`{jobid}` or `%(jobid)s`)
    pub fn expand(&self, template: &str) -> String {
        expand_jobid(template, &self.job_id)
    }
}

pub fn expand_jobid(template: &str, job_id: &str) -> String {
    template
        .replace("%(jobid)s", job_id)
        .replace("{jobid}", job_id)
}
