//! Certificate authority error types.

use cast_jobs::JobError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("Invalid request name: {0}")]
    InvalidName(String),

    #[error("Invalid certificate signing request: {0}")]
    InvalidRequest(String),

    #[error("{program} failed: {message}")]
    Command { program: String, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type CaResult<T> = Result<T, CaError>;

impl CaError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CaError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<CaError> for JobError {
    fn from(err: CaError) -> Self {
        let message = err.to_string();
        match err {
            CaError::InvalidName(_) | CaError::InvalidRequest(_) => JobError::Invalid(message),
            CaError::Command { .. } => JobError::Internal(message),
            CaError::Io { source, .. } => JobError::Io {
                message,
                errno: source.raw_os_error(),
            },
        }
    }
}
