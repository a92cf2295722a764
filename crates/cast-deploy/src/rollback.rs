//! Compensating actions for multi-step deployments.
//!
//! Each step that changes the host pushes the action that undoes it. On
//! failure the actions run newest first. Failures while undoing are logged
//! and attached to the original error, which is never replaced.

use std::path::PathBuf;

use cast_jobs::JobError;
use tracing::{debug, error};

use crate::files::swap_symlink;
use crate::services::ServiceManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
    DestroyService(String),
    /// Point `link` back at `previous`.
    RestoreLink { link: PathBuf, previous: PathBuf },
}

#[derive(Debug, Default)]
pub struct Rollback {
    actions: Vec<Undo>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, undo: Undo) {
        self.actions.push(undo);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Forget every action; the work is kept.
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Undo everything, newest first, and return the error to report.
    pub async fn unwind(mut self, services: &dyn ServiceManager, cause: JobError) -> JobError {
        let actions = std::mem::take(&mut self.actions);
        let mut failures = Vec::new();
        for undo in actions.into_iter().rev() {
            debug!(?undo, "rolling back");
            if let Err(message) = apply(&undo, services).await {
                error!(?undo, error = %message, "rollback step failed");
                failures.push(message);
            }
        }
        if failures.is_empty() {
            cause
        } else {
            JobError::RollbackFailed {
                error: Box::new(cause),
                rollback_errors: failures,
            }
        }
    }
}

async fn apply(undo: &Undo, services: &dyn ServiceManager) -> Result<(), String> {
    match undo {
        Undo::RemoveDir(path) => match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(format!("removing {}: {e}", path.display()))
            }
            _ => Ok(()),
        },
        Undo::RemoveFile(path) => match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(format!("removing {}: {e}", path.display()))
            }
            _ => Ok(()),
        },
        Undo::DestroyService(name) => {
            if !services.exists(name).await {
                return Ok(());
            }
            services
                .destroy(name)
                .await
                .map_err(|e| format!("destroying service {name}: {e}"))
        }
        Undo::RestoreLink { link, previous } => {
            let (link, previous) = (link.clone(), previous.clone());
            tokio::task::spawn_blocking(move || swap_symlink(&link, &previous))
                .await
                .map_err(|e| format!("restoring link: {e}"))?
                .map_err(|e| format!("restoring link: {e}"))
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            error!(pending = self.actions.len(), "rollback dropped without commit or unwind");
        }
    }
}
