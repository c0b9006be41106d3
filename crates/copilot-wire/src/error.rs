//! Errors from the wire protocol layer.

use copilot_bus::BusError;
use copilot_directory::DirectoryError;
use thiserror::Error;

/// Why a connection, session, or wire operation failed.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Certificate error: {0}")]
    Certificate(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Line too long (max {max} bytes)")]
    LineTooLong { max: usize },
    #[error("Timed out during {0}")]
    Timeout(&'static str),
    #[error("Peer presented no certificate")]
    MissingPeerCertificate,
    #[error("Dialed '{expected}' but the certificate names '{presented}'")]
    NameMismatch { expected: String, presented: String },
    #[error("Node '{0}' is not known")]
    UnknownNode(String),
    #[error("Certificate of '{0}' awaits approval")]
    AwaitingApproval(String),
    #[error("Certificate of '{0}' does not match the pinned fingerprint")]
    FingerprintMismatch(String),
    #[error("Unexpected command '{command}' during {phase}")]
    UnexpectedCommand { phase: &'static str, command: String },
    #[error("Node '{0}' sent an empty shared secret")]
    InvalidSecret(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Challenge response from '{0}' is wrong")]
    ChallengeFailed(String),
    #[error("Trust for '{0}' changed during the secret exchange")]
    TrustChanged(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<rustls::Error> for WireError {
    fn from(err: rustls::Error) -> Self {
        WireError::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for WireError {
    fn from(err: rcgen::Error) -> Self {
        WireError::Certificate(err.to_string())
    }
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
