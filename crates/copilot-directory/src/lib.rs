//! Node directory — durable peer records for the copilot fabric.
//!
//! - [`NodeStore`]: the narrow get/save/delete/list/modify storage interface
//! - [`JsonFileStore`]: the `core.json` document implementation, locked
//!   across processes
//! - [`MemoryNodeStore`]: an in-process implementation for tests
//! - [`NodeDirectory`]: serializes every read-modify-write per node name and
//!   implements the certificate and secret decisions sessions rely on

pub mod directory;
pub mod error;
pub mod json_store;
pub mod store;

pub use directory::{CertCheck, NodeDirectory};
pub use error::{DirectoryError, DirectoryResult};
pub use json_store::JsonFileStore;
pub use store::{MemoryNodeStore, Modify, NodeStore};
