//! Content-addressed blob directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{AttachmentError, Result};

/// Directory of blob files, one per attachment id.
///
/// Ids are UUID strings generated by the registry; the id check below keeps
/// path traversal out even if a caller hands us something else.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, attachment_id: &str) -> Result<PathBuf> {
        if !is_safe_id(attachment_id) {
            return Err(AttachmentError::InvalidId(attachment_id.to_string()));
        }
        Ok(self.dir.join(attachment_id))
    }

    /// Write a blob, fsync'd before returning so a crash can't leave a
    /// metadata row pointing at a torn file.
    pub async fn write(&self, attachment_id: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(attachment_id)?;
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        Ok(path)
    }

    pub async fn read(&self, attachment_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(attachment_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a blob file. Missing files are fine — deletion runs after the
    /// DB row is gone and may race a previous sweep.
    pub async fn delete(&self, attachment_id: &str) -> Result<bool> {
        let path = self.path_for(attachment_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every file whose name is not in `referenced`. Returns the
    /// number removed. Idempotent: a second run removes nothing.
    pub async fn cleanup_orphans(&self, referenced: &HashSet<String>) -> Result<usize> {
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if referenced.contains(&name) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    info!(attachment_id = %name, "orphaned blob removed");
                }
                Err(e) => warn!(attachment_id = %name, error = %e, "failed to remove orphan"),
            }
        }
        Ok(removed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
