//! Shared state of the network layer.

use crate::registry::PeerRegistry;
use crate::tls::TlsIdentity;
use copilot_bus::{MessageBus, Plugin};
use copilot_directory::NodeDirectory;
use copilot_types::config::NetworkConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timing and policy knobs for sessions and transports.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Pause between dial attempts of an outgoing peer.
    pub reconnect_backoff: Duration,
    /// Bound on each read and write before a session is established.
    pub handshake_timeout: Duration,
    /// Bound on each relay write.
    pub write_timeout: Duration,
    /// Bound on relay reads; `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Create records for unknown incoming nodes instead of refusing them.
    pub allow_unknown_peers: bool,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for WireConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            allow_unknown_peers: config.allow_unknown_peers,
        }
    }
}

/// Everything sessions and transports share.
///
/// Holds the `TLS` plugin identity used for lifecycle events (`nodeReq`,
/// `nodeConnected`, `nodeDisconnect`) and admin answers.
#[derive(Debug)]
pub struct WireContext {
    pub node_name: String,
    pub bus: MessageBus,
    pub plugin: Plugin,
    pub directory: Arc<NodeDirectory>,
    pub identity: Arc<TlsIdentity>,
    pub config: WireConfig,
    pub peers: PeerRegistry,
    next_session: AtomicU64,
}

impl WireContext {
    pub fn new(
        bus: MessageBus,
        directory: Arc<NodeDirectory>,
        identity: Arc<TlsIdentity>,
        config: WireConfig,
    ) -> Arc<Self> {
        let plugin = bus.register_plugin("TLS");
        Arc::new(Self {
            node_name: identity.node_name().to_string(),
            bus,
            plugin,
            directory,
            identity,
            config,
            peers: PeerRegistry::new(),
            next_session: AtomicU64::new(0),
        })
    }

    /// A fresh session label, `SESSION-<n>`.
    pub fn next_session_label(&self) -> String {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        format!("SESSION-{n}")
    }
}
