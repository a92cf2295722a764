//! Bundle store error types.

use cast_core::ManifestError;
use cast_jobs::JobError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Invalid bundle name or version: {0}")]
    InvalidIdentity(String),

    #[error("Upload already in progress for {0}")]
    UploadInProgress(String),

    #[error("SHA1 mismatch")]
    ChecksumMismatch { expected: String, actual: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Error extracting tarball: {0}")]
    Extract(#[source] std::io::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type BundleResult<T> = Result<T, BundleError>;

impl BundleError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BundleError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<BundleError> for JobError {
    fn from(err: BundleError) -> Self {
        let message = err.to_string();
        match err {
            BundleError::InvalidIdentity(_) | BundleError::Manifest(_) => JobError::Invalid(message),
            BundleError::UploadInProgress(_) => JobError::Busy(message),
            BundleError::ChecksumMismatch { .. } => JobError::Checksum(message),
            BundleError::Extract(source) | BundleError::Io { source, .. } => JobError::Io {
                message,
                errno: source.raw_os_error(),
            },
        }
    }
}
