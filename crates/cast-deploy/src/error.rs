//! Deployment error types.

use std::path::Path;

use cast_core::ManifestError;
use cast_jobs::JobError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid instance name")]
    InvalidInstanceName,

    #[error("Invalid bundle name or version")]
    InvalidBundle,

    #[error("Instance name already in use")]
    NameInUse,

    #[error("Bundle {bundle} version {version} doesn't exist")]
    MissingBundleVersion { bundle: String, version: String },

    #[error("Instance '{instance}' already has version '{version}'")]
    VersionExists { instance: String, version: String },

    #[error("Instance '{0}' has no active version")]
    NoActiveVersion(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Error rendering template {path}: {message}")]
    Template { path: String, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type DeployResult<T> = Result<T, DeployError>;

impl DeployError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DeployError::Io {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for an I/O failure on a single path.
    pub(crate) fn at(op: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("{op} {}", path.display()), source)
    }
}

impl From<DeployError> for JobError {
    fn from(err: DeployError) -> Self {
        let message = err.to_string();
        match err {
            DeployError::Io { source, .. } => JobError::Io {
                message,
                errno: source.raw_os_error(),
            },
            _ => JobError::Invalid(message),
        }
    }
}
