//! Copilot kernel — assembles a running node.
//!
//! The kernel owns the message bus, the node directory backed by
//! `core.json`, the TLS identity and the transport, and registers the
//! built-in `co` and `tls` plugins. The one-shot commands in [`commands`]
//! act on the directory without starting anything.

pub mod commands;
pub mod config;
pub mod core_plugin;
pub mod error;
pub mod kernel;

pub use error::{KernelError, KernelResult};
pub use kernel::CopilotKernel;
