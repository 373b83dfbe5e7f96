//! Subprocess wrapper around the `zstor` binary and its metadata decoder.
//!
//! Exit codes are the only success signal; stdout/stderr are captured and
//! carried in errors for the logs. The uploader owns all retry and backend
//! logic, so every call here is a single attempt.

use crate::error::ZstorError;
use crate::meta::Metadata;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Client {
    binary: PathBuf,
    config: PathBuf,
    decoder: PathBuf,
}

impl Client {
    /// Build a client, verifying the binaries and config exist so a broken
    /// install fails at startup rather than at the first upload.
    pub fn new(binary: PathBuf, config: PathBuf, decoder: PathBuf) -> Result<Self, ZstorError> {
        if !binary.is_file() {
            return Err(ZstorError::BinaryMissing(binary));
        }
        if !config.is_file() {
            return Err(ZstorError::ConfigMissing(config));
        }
        if !decoder.is_file() {
            return Err(ZstorError::DecoderMissing(decoder));
        }
        Ok(Self {
            binary,
            config,
            decoder,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c").arg(&self.config);
        cmd
    }

    /// Upload one file under its own path as remote key. A file that no
    /// longer exists is not an error; zdb rotates fast and the retry sweep
    /// will never see it again either.
    pub async fn store(&self, path: &Path) -> Result<(), ZstorError> {
        if !path.exists() {
            debug!(path = %path.display(), "Skipping store of missing file");
            return Ok(());
        }

        let output = self
            .command()
            .arg("store")
            .arg("-s")
            .arg("--file")
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ZstorError::StoreFailed {
                path: path.to_path_buf(),
                detail: exit_detail(&output),
            });
        }
        info!(path = %path.display(), "Stored file");
        Ok(())
    }

    /// Upload an index file via a scratch-directory snapshot.
    ///
    /// zdb keeps appending to live index files, so the bytes are copied to a
    /// scratch directory first and the uploader is pointed at that copy with
    /// `-k` rooting the remote key at the original directory. The remote key
    /// stays `path` no matter what happens to the live file mid-upload.
    pub async fn store_index(&self, path: &Path) -> Result<(), ZstorError> {
        if !path.exists() {
            debug!(path = %path.display(), "Skipping store of missing index file");
            return Ok(());
        }

        let key_dir = path.parent().ok_or_else(|| ZstorError::SnapshotFailed {
            path: path.to_path_buf(),
            detail: "path has no parent directory".to_string(),
        })?;
        let file_name = path.file_name().ok_or_else(|| ZstorError::SnapshotFailed {
            path: path.to_path_buf(),
            detail: "path has no file name".to_string(),
        })?;

        let scratch = tempfile::Builder::new()
            .prefix("zstor-index-upload-")
            .tempdir()
            .map_err(|e| ZstorError::SnapshotFailed {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        if let Err(e) = tokio::fs::copy(path, scratch.path().join(file_name)).await {
            if e.kind() == io::ErrorKind::NotFound {
                debug!(path = %path.display(), "Index file vanished before snapshot");
                return Ok(());
            }
            return Err(ZstorError::SnapshotFailed {
                path: path.to_path_buf(),
                detail: e.to_string(),
            });
        }

        let output = self
            .command()
            .arg("store")
            .arg("-s")
            .arg("-d")
            .arg("-f")
            .arg(scratch.path())
            .arg("-k")
            .arg(key_dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ZstorError::StoreFailed {
                path: path.to_path_buf(),
                detail: exit_detail(&output),
            });
        }
        info!(path = %path.display(), "Stored index file");
        Ok(())
    }

    /// Rebuild a file from its shards, writing to `path`. Blocking callers
    /// (the missing-data hook) wait on this directly.
    pub async fn retrieve(&self, path: &Path) -> Result<(), ZstorError> {
        let output = self
            .command()
            .arg("retrieve")
            .arg("--file")
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ZstorError::RetrieveFailed {
                path: path.to_path_buf(),
                detail: exit_detail(&output),
            });
        }
        info!(path = %path.display(), "Retrieved file");
        Ok(())
    }

    /// One readiness probe against the backends.
    pub async fn test(&self) -> Result<(), ZstorError> {
        let output = self.command().arg("test").output().await?;
        if !output.status.success() {
            return Err(ZstorError::NotReady {
                detail: exit_detail(&output),
            });
        }
        Ok(())
    }

    /// Remote content checksum for `path`, or `None` when the backends hold
    /// nothing under that key. The uploader signals absence with a non-zero
    /// exit, which is not an error on this path.
    pub async fn check(&self, path: &Path) -> Result<Option<String>, ZstorError> {
        let output = self
            .command()
            .arg("check")
            .arg("--file")
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Ok(None);
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.is_empty() {
            Ok(None)
        } else {
            Ok(Some(hash))
        }
    }

    /// Decode the remote metadata for one path, `None` when absent.
    pub async fn get_metadata(&self, path: &Path) -> Result<Option<Metadata>, ZstorError> {
        let output = Command::new(&self.decoder)
            .arg("--config")
            .arg(&self.config)
            .arg("--file")
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            let detail = exit_detail(&output);
            if detail.contains("No metadata found") {
                return Ok(None);
            }
            return Err(ZstorError::MetadataQueryFailed { detail });
        }

        let metadata = serde_json::from_slice(&output.stdout)
            .map_err(|e| ZstorError::MetadataQueryFailed {
                detail: e.to_string(),
            })?;
        Ok(Some(metadata))
    }

    /// Decode every remote record, keyed by the uploader's remote-path
    /// strings (path hashes for current upload modes).
    pub async fn get_all_metadata(&self) -> Result<HashMap<String, Metadata>, ZstorError> {
        let output = Command::new(&self.decoder)
            .arg("--config")
            .arg(&self.config)
            .arg("--all")
            .output()
            .await?;

        if !output.status.success() {
            return Err(ZstorError::MetadataQueryFailed {
                detail: exit_detail(&output),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| ZstorError::MetadataQueryFailed {
            detail: e.to_string(),
        })
    }
}

fn exit_detail(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{}: {} {}", output.status, stdout.trim(), stderr.trim())
        .trim()
        .to_string()
}
