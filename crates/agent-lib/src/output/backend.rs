//! Backends persisting the accumulated job document

use crate::config::JobContext;
use crate::error::ConfigError;
use crate::models::JobDocument;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error};

pub(crate) const FILE_ID: &str = "file_output";
pub(crate) const HTTP_ID: &str = "http_output";

/// Sink for the writer's end-of-run flush
#[async_trait]
pub trait Backend: Send + Sync {
    async fn write(&self, document: &JobDocument) -> Result<()>;
}

/// Writes the job document as JSON to a local file
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(job: &JobContext) -> Result<Self, ConfigError> {
        let template: String = job.plugin(FILE_ID).get_or("path", "job-{jobid}.json".to_string())?;
        Ok(Self::new(job.expand(&template)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hidden sibling used while writing
    fn temp_path(&self) -> Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .with_context(|| format!("{} has no file name", self.path.display()))?;
        Ok(self
            .path
            .with_file_name(format!(".{}", name.to_string_lossy())))
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn write(&self, document: &JobDocument) -> Result<()> {
        let content = serde_json::to_vec_pretty(document).context("Failed to serialize job document")?;
        let temp = self.temp_path()?;

        let result = async {
            fs::write(&temp, &content)
                .await
                .with_context(|| format!("Failed to write {}", temp.display()))?;
            fs::rename(&temp, &self.path)
                .await
                .with_context(|| format!("Failed to rename {} into place", temp.display()))
        }
        .await;

        if result.is_err() {
            if let Err(e) = fs::remove_file(&temp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %temp.display(), error = %e, "Failed to remove temporary file");
                }
            }
        }
        result
    }
}

/// Uploads the job document to an upload receiver
pub struct HttpBackend {
    client: Client,
    url: String,
}

impl HttpBackend {
    /// `base_url` is the receiver root; the document goes to `<base_url>/<jobid>/<filename>`
    pub fn new(base_url: &str, job_id: &str, filename: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: format!("{HTTP_ID}.timeout"),
                reason: e.to_string(),
            })?;

        let url = format!("{}/{}/{}", base_url.trim_end_matches('/'), job_id, filename);
        Ok(Self { client, url })
    }

    pub fn from_config(job: &JobContext) -> Result<Self, ConfigError> {
        let config = job.plugin(HTTP_ID);
        let base_url: String = config.require("url")?;
        let filename: String = config.get_or("filename", "{jobid}.json".to_string())?;
        let timeout: u64 = config.get_or("timeout", 30)?;
        Self::new(
            &base_url,
            &job.job_id,
            &job.expand(&filename),
            Duration::from_secs(timeout),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn write(&self, document: &JobDocument) -> Result<()> {
        let body = serde_json::to_vec(document).context("Failed to serialize job document")?;

        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upload failed ({}): {}", status, body);
        }

        debug!(url = %self.url, "Uploaded job document");
        Ok(())
    }
}
