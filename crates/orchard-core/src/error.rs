//! Shared error taxonomy.

use thiserror::Error;

/// Result alias used across the orchestration crates.
pub type OrchardResult<T> = Result<T, OrchardError>;

/// Errors surfaced by orchestration operations.
#[derive(Debug, Error)]
pub enum OrchardError {
    /// Rejected before scheduling (unknown project, bad request shape).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Admitting the operation would exceed the project's running-instance cap.
    #[error("running instance limit exceeded for project {project} (limit {limit})")]
    LimitExceeded { project: String, limit: u32 },

    /// A compute-substrate failure, optionally carrying a process exit code.
    #[error("backend error: {message}")]
    Backend {
        message: String,
        exit_code: Option<i64>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// A poll deadline elapsed before the awaited condition held.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation was stopped by an explicit cancel during a build.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("state store error: {0}")]
    State(String),
}

impl OrchardError {
    /// Backend error with no exit code.
    pub fn backend(message: impl Into<String>) -> Self {
        OrchardError::Backend {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchardError::NotFound(_))
    }

    /// The exit code to record in a synthetic failure log entry.
    pub fn exit_code(&self) -> i64 {
        match self {
            OrchardError::Backend {
                exit_code: Some(code),
                ..
            } => *code,
            _ => -1,
        }
    }
}
