use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to delete {} obsolete restore job director(ies)", failures.len())]
    CleanupFailed { failures: Vec<(PathBuf, std::io::Error)> },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Job-scoped, irrecoverable failure.
///
/// Recorded once per job by the slice tracker and handed back, as the same
/// `Arc`, to every later submission for that job.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct RestoreJobFatalError {
    message: String,
}

impl RestoreJobFatalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum RestoreJobError {
    #[error("Restore job failed: {0}")]
    Fatal(Arc<RestoreJobFatalError>),

    #[error("Restore slice failed (retriable): {message}")]
    Retriable { message: String },
}

impl RestoreJobError {
    pub fn fatal(message: impl Into<String>) -> Self {
        RestoreJobError::Fatal(Arc::new(RestoreJobFatalError::new(message)))
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        RestoreJobError::Retriable {
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RestoreJobError::Fatal(_))
    }
}

impl From<Arc<RestoreJobFatalError>> for RestoreJobError {
    fn from(failure: Arc<RestoreJobFatalError>) -> Self {
        RestoreJobError::Fatal(failure)
    }
}

impl PartialEq for RestoreJobError {
    /// Fatal failures are equal only when they are the same recorded failure.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RestoreJobError::Fatal(a), RestoreJobError::Fatal(b)) => Arc::ptr_eq(a, b),
            (
                RestoreJobError::Retriable { message: a },
                RestoreJobError::Retriable { message: b },
            ) => a == b,
            _ => false,
        }
    }
}
