//! Plugin handles: a registered identity on the bus.

use crate::bus::{BusError, BusMessage, MessageBus};
use crate::handler::BusHandler;
use copilot_types::Envelope;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Public description of a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// Unique id: `name` followed by a dash and four random characters.
    pub id: String,
    /// Human readable name given at registration.
    pub name: String,
}

/// A named participant on the bus.
///
/// Everything a plugin publishes is tagged with its id, so none of its own
/// listeners see it.
#[derive(Debug, Clone)]
pub struct Plugin {
    info: PluginInfo,
    bus: MessageBus,
}

impl Plugin {
    pub(crate) fn new(name: &str, bus: MessageBus) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(char::from)
            .collect();
        Self {
            info: PluginInfo {
                id: format!("{name}-{suffix}"),
                name: name.to_string(),
            },
            bus,
        }
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The bus this plugin is registered on.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Listen for `group` (empty = every group).
    pub fn listen(&self, group: &str, handler: Arc<dyn BusHandler>) {
        self.bus.register(&self.info.id, group, handler);
    }

    /// Listen for `group` through a channel.
    pub fn subscribe(&self, group: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        self.bus.subscribe(&self.info.id, group)
    }

    /// Publish a message built from its five fields.
    pub async fn publish(
        &self,
        source_node: &str,
        target_node: &str,
        group: &str,
        command: &str,
        payload: &str,
    ) -> Result<u64, BusError> {
        self.publish_envelope(Envelope::new(
            source_node,
            target_node,
            group,
            command,
            payload,
        ))
        .await
    }

    /// Publish a prepared envelope.
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<u64, BusError> {
        self.bus.publish(&self.info.id, envelope).await
    }

    /// Publish the answer to `request`: source and target swapped, same group.
    pub async fn answer(
        &self,
        request: &Envelope,
        command: &str,
        payload: &str,
    ) -> Result<u64, BusError> {
        self.publish_envelope(request.reply(command, payload)).await
    }

    /// Publish `envelopes` in order from a background task.
    ///
    /// This is how handlers reply: awaiting `publish` on the dispatch worker
    /// would block it once the queue is full.
    pub fn publish_detached(&self, envelopes: Vec<Envelope>) -> JoinHandle<()> {
        let plugin = self.clone();
        tokio::spawn(async move {
            for envelope in envelopes {
                if let Err(e) = plugin.publish_envelope(envelope).await {
                    warn!(plugin = %plugin.id(), error = %e, "Dropping reply");
                    break;
                }
            }
        })
    }

    /// Remove this plugin and all of its listeners from the bus.
    pub fn deregister(&self) {
        self.bus.remove_plugin(&self.info.id);
    }
}
