use thiserror::Error;

use crate::job::JobId;

/// Result type for carousel operations.
pub type Result<T> = std::result::Result<T, CarouselError>;

/// Errors that can occur in the queue system.
#[derive(Debug, Error)]
pub enum CarouselError {
    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Job is in a state that does not permit the requested transition
    #[error("Job {0} is in state {1}, expected {2}")]
    InvalidState(JobId, String, String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
