//! Kernel-specific error types.

use copilot_bus::BusError;
use copilot_directory::DirectoryError;
use copilot_types::CopilotError;
use copilot_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping the errors of the crates it drives.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped CopilotError.
    #[error(transparent)]
    Copilot(#[from] CopilotError),

    /// Node directory failure.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Network layer failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The bus worker is gone.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// An I/O error outside the stores (data dir, signals).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A `host:port` argument could not be parsed.
    #[error("Invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
