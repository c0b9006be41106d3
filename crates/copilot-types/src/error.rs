//! Shared error types for the copilot fabric.

use thiserror::Error;

/// Failures of the trust mutators on a [`crate::NodeRecord`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// A fingerprint is already pinned; it cannot be overwritten by acceptance.
    #[error("Can not overwrite an already accepted key")]
    AlreadyTrusted,

    /// There is no pending fingerprint to accept.
    #[error("No key requested")]
    NothingPending,
}

/// Top-level error type for the copilot fabric.
#[derive(Error, Debug)]
pub enum CopilotError {
    /// The requested node record does not exist.
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    /// A trust mutation was refused.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid user input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Alias for Result with CopilotError.
pub type CopilotResult<T> = Result<T, CopilotError>;
