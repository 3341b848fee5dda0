//! Error types for patchtag.

use thiserror::Error;

use crate::models::{CommentId, ProjectId, SubmissionId};

/// Result type alias using patchtag's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for patchtag operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Submission (patch or cover letter) not found
    #[error("Submission not found: {0}")]
    SubmissionNotFound(SubmissionId),

    /// Comment not found
    #[error("Comment not found: {0}")]
    CommentNotFound(CommentId),

    /// Project not found
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    /// Storage adapter rejected or failed a write
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input (bad tag pattern, malformed filter query, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
