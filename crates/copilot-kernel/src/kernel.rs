//! Assembles and runs one node.

use crate::commands::open_directory;
use crate::core_plugin::CorePlugin;
use crate::error::KernelResult;
use copilot_bus::{MessageBus, Plugin};
use copilot_directory::NodeDirectory;
use copilot_types::config::CopilotConfig;
use copilot_types::NodeRole;
use copilot_wire::{AdminHandler, TlsIdentity, Transport, WireConfig, WireContext};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// A booted node: bus, directory, identity, plugins and transport.
pub struct CopilotKernel {
    /// Effective configuration.
    pub config: CopilotConfig,
    /// The node's message bus.
    pub bus: MessageBus,
    /// Node records, backed by `core.json`.
    pub directory: Arc<NodeDirectory>,
    /// Shared state of the network layer.
    pub wire: Arc<WireContext>,
    /// Listeners and dialers.
    pub transport: Transport,
    core: Plugin,
    bus_worker: JoinHandle<()>,
}

impl CopilotKernel {
    /// Build every subsystem. Nothing listens or dials until [`start`].
    ///
    /// [`start`]: CopilotKernel::start
    pub async fn boot(config: CopilotConfig) -> KernelResult<Self> {
        info!(node = %config.node_name, data_dir = %config.data_dir.display(), "Booting copilot node");
        std::fs::create_dir_all(&config.data_dir)?;

        let directory = Arc::new(open_directory(&config));
        directory
            .ensure_node(&config.node_name, NodeRole::Undefined)
            .await?;

        let identity = TlsIdentity::load_or_generate(&config.data_dir, &config.node_name)?;
        info!(fingerprint = %identity.fingerprint(), "Node identity loaded");

        let (bus, bus_worker) = MessageBus::start(config.bus.queue_capacity);
        let wire = WireContext::new(
            bus.clone(),
            Arc::clone(&directory),
            Arc::new(identity),
            WireConfig::from(&config.network),
        );
        AdminHandler::register(&wire);
        let core = CorePlugin::register(&bus, &config.node_name, Arc::clone(&directory));
        let transport = Transport::new(Arc::clone(&wire));

        Ok(Self {
            config,
            bus,
            directory,
            wire,
            transport,
            core,
            bus_worker,
        })
    }

    /// Start listeners and dialers from the node records. Returns the
    /// addresses bound.
    pub async fn start(&self) -> KernelResult<Vec<SocketAddr>> {
        let bound = self.transport.start().await?;
        info!(
            node = %self.config.node_name,
            listeners = bound.len(),
            plugins = self.bus.plugins().len(),
            "Copilot node started"
        );
        Ok(bound)
    }

    /// Start, then run until Ctrl+C.
    pub async fn run(self) -> KernelResult<()> {
        self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        self.shutdown().await;
        Ok(())
    }

    /// Stop the transport, drop the plugins and stop the bus worker.
    pub async fn shutdown(self) {
        self.transport.shutdown().await;
        self.core.deregister();
        self.wire.plugin.deregister();
        self.bus_worker.abort();
        info!(node = %self.config.node_name, "Copilot node stopped");
    }
}
