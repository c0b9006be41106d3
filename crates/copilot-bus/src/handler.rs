//! Listener side of the bus.

use crate::bus::BusMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A bus listener.
///
/// Handlers are invoked one after another on the dispatch worker, so a slow
/// handler delays every message queued behind it. Handlers must not await
/// [`crate::MessageBus::publish`] themselves; use
/// [`crate::Plugin::publish_detached`] for replies.
#[async_trait]
pub trait BusHandler: Send + Sync + 'static {
    /// Called for every message matching the listener's group filter.
    async fn on_message(&self, msg: &BusMessage);
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> BusHandler for FnHandler<F>
where
    F: Fn(&BusMessage) + Send + Sync + 'static,
{
    async fn on_message(&self, msg: &BusMessage) {
        (self.f)(msg)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn BusHandler>
where
    F: Fn(&BusMessage) + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Forwards every message into an unbounded channel.
pub(crate) struct ChannelHandler {
    pub(crate) tx: mpsc::UnboundedSender<BusMessage>,
}

#[async_trait]
impl BusHandler for ChannelHandler {
    async fn on_message(&self, msg: &BusMessage) {
        // A dropped receiver just means the subscriber went away.
        let _ = self.tx.send(msg.clone());
    }
}
