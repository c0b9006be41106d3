//! Bounded FIFO message bus with a single dispatch worker.
//!
//! Publishers enqueue envelopes; the worker takes them one at a time and
//! hands each to every matching listener in registration order. A listener
//! never sees messages published by its own owner. When the queue is full,
//! `publish` waits: that is the bus's only backpressure.

use crate::handler::{BusHandler, ChannelHandler};
use crate::plugin::{Plugin, PluginInfo};
use copilot_types::Envelope;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Default capacity of the dispatch queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Errors from the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message bus is closed")]
    Closed,
}

/// A message as delivered to listeners.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Monotonic sequence number, unique for the lifetime of the bus.
    pub id: u64,
    /// Id of the plugin that published the message. Never leaves the process.
    pub sender: String,
    /// The routed envelope.
    pub envelope: Envelope,
}

struct ListenerEntry {
    owner_id: String,
    group: String,
    handler: Arc<dyn BusHandler>,
}

#[derive(Default)]
struct Registry {
    listeners: Vec<ListenerEntry>,
    plugins: Vec<PluginInfo>,
}

enum Queued {
    Message(BusMessage),
    Barrier(oneshot::Sender<()>),
}

struct BusInner {
    registry: Arc<Mutex<Registry>>,
    queue: mpsc::Sender<Queued>,
    /// Next sequence id. Held while a message is handed to the queue, so
    /// dispatch order and id order agree.
    next_id: Mutex<u64>,
}

/// Handle to a running bus. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("listeners", &self.count())
            .field("queue_capacity", &self.inner.queue.max_capacity())
            .finish()
    }
}

impl MessageBus {
    /// Create a bus and spawn its dispatch worker on the current runtime.
    pub fn start(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let registry = Arc::new(Mutex::new(Registry::default()));
        let worker = tokio::spawn(dispatch_loop(rx, Arc::clone(&registry)));
        let bus = Self {
            inner: Arc::new(BusInner {
                registry,
                queue: tx,
                next_id: Mutex::new(0),
            }),
        };
        (bus, worker)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Create and register a new plugin identity.
    pub fn register_plugin(&self, name: &str) -> Plugin {
        let plugin = Plugin::new(name, self.clone());
        let count = {
            let mut registry = self.registry();
            registry.plugins.push(plugin.info().clone());
            registry.plugins.len()
        };
        debug!(plugin = %plugin.id(), plugins = count, "Plugin registered");
        plugin
    }

    /// Remove a plugin identity and every listener it owns.
    pub(crate) fn remove_plugin(&self, plugin_id: &str) {
        let removed = {
            let mut registry = self.registry();
            registry.plugins.retain(|p| p.id != plugin_id);
            let before = registry.listeners.len();
            registry.listeners.retain(|l| l.owner_id != plugin_id);
            before - registry.listeners.len()
        };
        debug!(plugin = %plugin_id, listeners = removed, "Plugin deregistered");
    }

    /// Snapshot of the registered plugin identities.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.registry().plugins.clone()
    }

    /// Add a listener owned by `owner_id`. An empty `group` matches every group.
    ///
    /// Duplicate registrations are kept; each one is invoked.
    pub fn register(&self, owner_id: &str, group: &str, handler: Arc<dyn BusHandler>) {
        let mut registry = self.registry();
        registry.listeners.push(ListenerEntry {
            owner_id: owner_id.to_string(),
            group: group.to_string(),
            handler,
        });
        if group.is_empty() {
            debug!(owner = %owner_id, "Listening for all groups");
        } else {
            debug!(owner = %owner_id, group = %group, "Listening for group");
        }
    }

    /// Remove every listener owned by `owner_id`. Returns how many were removed.
    pub fn deregister(&self, owner_id: &str) -> usize {
        let mut registry = self.registry();
        let before = registry.listeners.len();
        registry.listeners.retain(|l| l.owner_id != owner_id);
        before - registry.listeners.len()
    }

    /// Register a listener that forwards matching messages into a channel.
    pub fn subscribe(&self, owner_id: &str, group: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(owner_id, group, Arc::new(ChannelHandler { tx }));
        rx
    }

    /// Number of registered listeners.
    pub fn count(&self) -> usize {
        self.registry().listeners.len()
    }

    /// Enqueue `envelope` on behalf of `sender_id`. Waits while the queue is full.
    ///
    /// Returns the sequence id assigned to the message. Ids increase in
    /// dispatch order.
    pub async fn publish(&self, sender_id: &str, envelope: Envelope) -> Result<u64, BusError> {
        let permit = self
            .inner
            .queue
            .reserve()
            .await
            .map_err(|_| BusError::Closed)?;
        let mut next_id = self.inner.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = *next_id;
        *next_id += 1;
        debug!(
            msg_id = id,
            from = %sender_id,
            target = %envelope.target_node,
            group = %envelope.group,
            command = %envelope.command,
            "Publishing message"
        );
        permit.send(Queued::Message(BusMessage {
            id,
            sender: sender_id.to_string(),
            envelope,
        }));
        Ok(id)
    }

    /// Wait until every message enqueued before this call has been dispatched.
    pub async fn sync(&self) -> Result<(), BusError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .queue
            .send(Queued::Barrier(tx))
            .await
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)
    }
}

async fn dispatch_loop(mut rx: mpsc::Receiver<Queued>, registry: Arc<Mutex<Registry>>) {
    debug!("Bus dispatch worker started");
    while let Some(item) = rx.recv().await {
        match item {
            Queued::Message(msg) => dispatch(&registry, &msg).await,
            Queued::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Bus dispatch worker stopped");
}

async fn dispatch(registry: &Mutex<Registry>, msg: &BusMessage) {
    // Snapshot so handlers may (de)register without deadlocking the worker.
    let targets: Vec<(String, Arc<dyn BusHandler>)> = {
        let registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .listeners
            .iter()
            .filter(|l| l.owner_id != msg.sender)
            .filter(|l| l.group.is_empty() || l.group == msg.envelope.group)
            .map(|l| (l.owner_id.clone(), Arc::clone(&l.handler)))
            .collect()
    };

    for (owner, handler) in targets {
        let outcome = AssertUnwindSafe(handler.on_message(msg))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!(msg_id = msg.id, listener = %owner, "Bus handler panicked");
        }
    }
}
