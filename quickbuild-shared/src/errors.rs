//! Error types used across the Quickbuild runtime.

use thiserror::Error;

/// Result type for Quickbuild operations.
pub type QbResult<T> = Result<T, QbError>;

#[derive(Debug, Error)]
pub enum QbError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("shared memory queue error: {0}")]
    Shmq(String),

    #[error("supervisor error: {0}")]
    Supervisor(String),

    #[error("launch error: {0}")]
    Launch(String),

    #[error("internal error: {0}")]
    Internal(String),
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for QbError {
    fn from(err: std::io::Error) -> Self {
        QbError::Internal(format!("I/O error: {}", err))
    }
}

impl From<String> for QbError {
    fn from(err: String) -> Self {
        QbError::Internal(err)
    }
}

impl From<&str> for QbError {
    fn from(err: &str) -> Self {
        QbError::Internal(err.to_string())
    }
}
