//! Directory error types.

use copilot_types::{CopilotError, TrustError};
use thiserror::Error;

/// Errors from node storage and the directory.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// No record with that name.
    #[error("Node '{0}' not found")]
    NotFound(String),

    /// A trust mutation was refused.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// The stored document is not shaped like a node document.
    #[error("Invalid node document {path}: {reason}")]
    InvalidDocument { path: String, reason: String },

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading or writing the document failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with DirectoryError.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

impl From<DirectoryError> for CopilotError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(name) => CopilotError::NodeNotFound(name),
            DirectoryError::Trust(e) => CopilotError::Trust(e),
            DirectoryError::Serialization(e) => CopilotError::Serialization(e),
            DirectoryError::Io(e) => CopilotError::Io(e),
            other @ DirectoryError::InvalidDocument { .. } => {
                CopilotError::Config(other.to_string())
            }
        }
    }
}
