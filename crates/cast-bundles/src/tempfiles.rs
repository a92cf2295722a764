//! Scratch paths for uploads and extraction.
//!
//! The temp directory lives under the data root so finished files can be
//! renamed into place without crossing filesystems. It is wiped on init.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cast_jobs::{JobError, JobResult, Manager};
use tracing::{debug, warn};

pub const TEMP_FILE_MANAGER: &str = "tempfiles";

pub struct TempFileManager {
    root: PathBuf,
    counter: AtomicU64,
}

impl TempFileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh path under the temp directory. Nothing is created on disk.
    pub fn allocate(&self, extension: &str) -> TempPath {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!(".cast_tmp_{}_{n}{extension}", std::process::id());
        TempPath {
            path: Some(self.root.join(name)),
        }
    }

    /// Remove a file or directory tree, ignoring paths that are already gone.
    pub async fn free(&self, path: &Path) {
        if let Err(e) = remove_any(path).await {
            warn!(path = ?path, error = %e, "failed to remove temp path");
        }
    }
}

#[async_trait]
impl Manager for TempFileManager {
    fn name(&self) -> &'static str {
        TEMP_FILE_MANAGER
    }

    async fn init(&self) -> JobResult<()> {
        remove_any(&self.root)
            .await
            .map_err(|e| JobError::io(format!("clearing {}", self.root.display()), &e))?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| JobError::io(format!("creating {}", self.root.display()), &e))?;
        tokio::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| JobError::io(format!("chmod {}", self.root.display()), &e))?;
        debug!(root = ?self.root, "temp directory ready");
        Ok(())
    }
}

/// A temp path that is removed when dropped unless it was freed or kept.
#[derive(Debug)]
pub struct TempPath {
    path: Option<PathBuf>,
}

impl TempPath {
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    /// Remove the path now.
    pub async fn free(mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = remove_any(&path).await {
                warn!(path = ?path, error = %e, "failed to remove temp path");
            }
        }
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let result = match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(_) => Ok(()),
        };
        if let Err(e) = result {
            warn!(path = ?path, error = %e, "failed to remove temp path");
        }
    }
}

pub(crate) async fn remove_any(path: &Path) -> std::io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
