//! Configuration types for a copilot node.
//!
//! Every field has a default so a missing or partial `copilot.toml` still
//! yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopilotConfig {
    /// Name of this node. Also the CN of its TLS certificate.
    pub node_name: String,
    /// Directory holding `core.json` and the node's key material.
    pub data_dir: PathBuf,
    /// Default tracing filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Message bus settings.
    pub bus: BusConfig,
    /// Transport and session settings.
    pub network: NetworkConfig,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            data_dir: PathBuf::from("."),
            log_level: "info".to_string(),
            bus: BusConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl CopilotConfig {
    /// Path of the node directory document.
    pub fn nodes_path(&self) -> PathBuf {
        self.data_dir.join("core.json")
    }
}

/// Message bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of the dispatch queue. Publishers wait when it is full.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

/// Transport and session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Pause between connection attempts of an outgoing peer.
    pub reconnect_backoff_secs: u64,
    /// Bound on every read/write before a session is established.
    pub handshake_timeout_secs: u64,
    /// Bound on every relay write.
    pub write_timeout_secs: u64,
    /// Bound on relay reads; 0 disables the idle timeout.
    pub idle_timeout_secs: u64,
    /// Accept trust requests from nodes that have no record yet.
    pub allow_unknown_peers: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: 10,
            handshake_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 0,
            allow_unknown_peers: false,
        }
    }
}

/// The host name of this machine, or `"unknown"`.
pub fn default_node_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
