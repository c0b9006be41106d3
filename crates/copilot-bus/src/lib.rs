//! Message bus — in-process publish/subscribe for copilot plugins.
//!
//! ## Architecture
//!
//! - **MessageBus**: bounded FIFO queue drained by a single dispatch worker
//! - **Plugin**: registration handle used to publish and listen; a plugin
//!   never receives the messages it published itself
//! - **BusHandler**: the trait listeners implement; closures and channels
//!   are adapted with [`handler_fn`] and [`MessageBus::subscribe`]

pub mod bus;
pub mod handler;
pub mod plugin;

pub use bus::{BusError, BusMessage, MessageBus, DEFAULT_QUEUE_CAPACITY};
pub use handler::{handler_fn, BusHandler};
pub use plugin::{Plugin, PluginInfo};
