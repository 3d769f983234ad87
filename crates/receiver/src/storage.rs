//! Atomic on-disk storage of uploaded files
//!
//! An upload is written to a hidden `.<filename>` in the target directory and
//! renamed into place once complete, so readers never see a partial file.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid job id {0:?}")]
    InvalidJobId(String),

    #[error("invalid filename {0:?}")]
    InvalidFilename(String),

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Whether the request itself was at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidJobId(_) | Self::InvalidFilename(_))
    }
}

/// Upload destination rooted at `base_path`
#[derive(Debug, Clone)]
pub struct UploadStore {
    base_path: PathBuf,
    jobid_hash_size: Option<u64>,
}

impl UploadStore {
    pub fn new(base_path: impl Into<PathBuf>, jobid_hash_size: Option<u64>) -> Self {
        Self {
            base_path: base_path.into(),
            jobid_hash_size,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory an upload for `jobid` lands in
    pub fn target_dir(&self, jobid: &str) -> Result<PathBuf, StoreError> {
        let id: u64 = jobid
            .parse()
            .map_err(|_| StoreError::InvalidJobId(jobid.to_string()))?;

        Ok(match self.jobid_hash_size {
            Some(size) if size > 0 => self.base_path.join((id / size).to_string()),
            _ => self.base_path.clone(),
        })
    }

    /// Store `body` as `<target_dir>/<filename>`, returning the final path
    pub async fn store(&self, jobid: &str, filename: &str, body: &[u8]) -> Result<PathBuf, StoreError> {
        validate_filename(filename)?;
        let dir = self.target_dir(jobid)?;

        if self.jobid_hash_size.is_some() {
            ensure_dir(&dir).await?;
        }

        let temp = dir.join(format!(".{filename}"));
        let target = dir.join(filename);

        let written = async {
            fs::write(&temp, body).await?;
            fs::rename(&temp, &target).await
        }
        .await;

        if let Err(source) = written {
            debug!(path = %temp.display(), error = %source, "Failed to write upload");
            if let Err(e) = fs::remove_file(&temp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %temp.display(), error = %e, "Failed to remove temporary file");
                }
            }
            return Err(StoreError::Write {
                path: target,
                source,
            });
        }

        Ok(target)
    }
}

/// Reject names that would escape the target directory or collide with temp files
fn validate_filename(filename: &str) -> Result<(), StoreError> {
    if filename.is_empty()
        || filename.starts_with('.')
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
    {
        return Err(StoreError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// Create `dir` unless it exists; losing a creation race to another request is fine
async fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(());
    }

    match fs::create_dir(dir).await {
        Ok(()) => Ok(()),
        Err(_) if fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) => Ok(()),
        Err(source) => Err(StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_target_dir_hashing() {
        let store = UploadStore::new("/data", Some(1000));
        assert_eq!(store.target_dir("123456").unwrap(), PathBuf::from("/data/123"));
        assert_eq!(store.target_dir("999").unwrap(), PathBuf::from("/data/0"));

        let flat = UploadStore::new("/data", None);
        assert_eq!(flat.target_dir("123456").unwrap(), PathBuf::from("/data"));
    }

    #[test]
    fn test_non_numeric_jobid_is_rejected() {
        let store = UploadStore::new("/data", None);
        let err = store.target_dir("../etc").unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_filename_validation() {
        assert!(validate_filename("job-42.json").is_ok());
        for bad in ["", ".hidden", "a/b", "..", "a\\b"] {
            assert!(validate_filename(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_store_creates_hash_dir_and_renames() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path(), Some(10));

        let path = store.store("42", "out.log", b"payload").await.unwrap();

        assert_eq!(path, dir.path().join("4").join("out.log"));
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert!(!dir.path().join("4").join(".out.log").exists());
    }

    #[tokio::test]
    async fn test_existing_hash_dir_is_reused() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("4")).unwrap();
        let store = UploadStore::new(dir.path(), Some(10));

        store.store("45", "a.json", b"1").await.unwrap();
        store.store("49", "a.json", b"2").await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("4").join("a.json")).unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().join("missing"), None);

        let err = store.store("42", "out.log", b"payload").await.unwrap_err();

        assert!(!err.is_client_error());
        assert!(!dir.path().join("missing").exists());
    }
}
