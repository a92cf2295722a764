//! Job outcome errors.
//!
//! `JobError` is the value a failed job completes with. It is cloned to
//! every waiter and serialized into job snapshots, so it carries messages
//! rather than source errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a hook child process failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailure {
    /// Exited with a non-zero status code.
    Exited(i32),
    /// Terminated by a signal it did not receive from us.
    Signaled(Option<i32>),
    /// Killed after exceeding its timeout.
    TimedOut,
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    #[error("{resource_type} '{name}' does not exist.")]
    NotFound { resource_type: String, name: String },

    #[error("{resource_type} '{name}' already exists.")]
    AlreadyExists { resource_type: String, name: String },

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Checksum(String),

    #[error("{0}")]
    Busy(String),

    #[error("{message}")]
    Hook {
        hook: String,
        failure: HookFailure,
        message: String,
    },

    #[error("{message}")]
    Io { message: String, errno: Option<i32> },

    /// The original failure, plus whatever went wrong while undoing it.
    #[error("{error}")]
    RollbackFailed {
        error: Box<JobError>,
        rollback_errors: Vec<String>,
    },

    #[error("{0}")]
    Internal(String),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub fn not_found(resource_type: &str, name: &str) -> Self {
        JobError::NotFound {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(resource_type: &str, name: &str) -> Self {
        JobError::AlreadyExists {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        JobError::Invalid(message.into())
    }

    /// Wrap an I/O error with the operation that produced it, keeping errno.
    pub fn io(context: impl std::fmt::Display, err: &std::io::Error) -> Self {
        JobError::Io {
            message: format!("{context}: {err}"),
            errno: err.raw_os_error(),
        }
    }

    /// HTTP-style response code for API collaborators.
    pub fn status_code(&self) -> u16 {
        match self {
            JobError::NotFound { .. } => 404,
            JobError::AlreadyExists { .. } | JobError::Busy(_) => 409,
            JobError::Invalid(_) | JobError::Checksum(_) => 400,
            JobError::RollbackFailed { error, .. } => error.status_code(),
            JobError::Hook { .. } | JobError::Io { .. } | JobError::Internal(_) => 500,
        }
    }

    /// The error that started it all, looking through rollback wrappers.
    pub fn root(&self) -> &JobError {
        match self {
            JobError::RollbackFailed { error, .. } => error.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Io {
            message: err.to_string(),
            errno: err.raw_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existence_messages() {
        assert_eq!(
            JobError::already_exists("Instance", "foo0").to_string(),
            "Instance 'foo0' already exists."
        );
        assert_eq!(
            JobError::not_found("Bundle", "fooapp@1.0").to_string(),
            "Bundle 'fooapp@1.0' does not exist."
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(JobError::not_found("Instance", "x").status_code(), 404);
        assert_eq!(JobError::already_exists("Instance", "x").status_code(), 409);
        assert_eq!(JobError::Checksum("SHA1 mismatch".into()).status_code(), 400);
        assert_eq!(JobError::Internal("boom".into()).status_code(), 500);
    }

    #[test]
    fn rollback_failure_keeps_original_message() {
        let err = JobError::RollbackFailed {
            error: Box::new(JobError::invalid("Invalid bundle name or version")),
            rollback_errors: vec!["remove /x: permission denied".into()],
        };
        assert_eq!(err.to_string(), "Invalid bundle name or version");
        assert_eq!(err.status_code(), 400);
        assert!(matches!(err.root(), JobError::Invalid(_)));
    }

    #[test]
    fn io_errors_keep_errno() {
        let io = std::io::Error::from_raw_os_error(2);
        let err = JobError::io("stat /nope", &io);
        match err {
            JobError::Io { message, errno } => {
                assert!(message.starts_with("stat /nope: "));
                assert_eq!(errno, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn serializes_with_kind_tag() {
        let value = serde_json::to_value(JobError::Busy("Upload already in progress".into())).unwrap();
        assert_eq!(value["kind"], "busy");
        assert_eq!(value["detail"], "Upload already in progress");
    }
}
