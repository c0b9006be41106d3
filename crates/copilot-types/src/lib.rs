//! Core types for the copilot node fabric.
//!
//! This crate defines the data structures shared by the message bus, the
//! node directory and the wire protocol. It contains no I/O.

pub mod config;
pub mod envelope;
pub mod error;
pub mod node;

pub use envelope::Envelope;
pub use error::{CopilotError, CopilotResult, TrustError};
pub use node::{NodeRecord, NodeRole, DEFAULT_HOST, DEFAULT_PORT};
