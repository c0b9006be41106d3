//! The `co` group: node name and directory queries over the bus.
//!
//! | command       | answer                                        |
//! |---------------|-----------------------------------------------|
//! | `nodeNameGet` | `nodeName` with this node's name              |
//! | `getNodes`    | one `node` per record, then `nodeEnd`         |
//! | `nodeDelete`  | `nodeDeleteOk`, or `error`                    |
//! | `ping`        | `pong` with the same payload                  |
//!
//! `nodeNameGet` is answered whatever the target; everything else only
//! when addressed to this node.

use async_trait::async_trait;
use copilot_bus::{BusHandler, BusMessage, MessageBus, Plugin};
use copilot_directory::NodeDirectory;
use copilot_types::{Envelope, NodeRecord};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Group handled by the core plugin.
pub const CORE_GROUP: &str = "co";

/// Handler for the `co` group.
pub struct CorePlugin {
    plugin: Plugin,
    node_name: String,
    directory: Arc<NodeDirectory>,
}

impl CorePlugin {
    /// Register the `Core` plugin identity and listen on `co`.
    pub fn register(bus: &MessageBus, node_name: &str, directory: Arc<NodeDirectory>) -> Plugin {
        let plugin = bus.register_plugin("Core");
        plugin.listen(
            CORE_GROUP,
            Arc::new(Self {
                plugin: plugin.clone(),
                node_name: node_name.to_string(),
                directory,
            }),
        );
        plugin
    }

    fn answer(&self, request: &Envelope, command: &str, payload: impl Into<String>) -> Envelope {
        let mut answer = request.reply(command, payload);
        if answer.source_node.is_empty() {
            answer.source_node = self.node_name.clone();
        }
        answer
    }

    fn node_answers(&self, request: &Envelope) -> Vec<Envelope> {
        let records = match self.directory.list() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Could not list nodes");
                return vec![self.answer(request, "error", e.to_string())];
            }
        };
        let mut answers: Vec<Envelope> = records
            .iter()
            .map(|record| self.answer(request, "node", node_payload(record)))
            .collect();
        answers.push(self.answer(request, "nodeEnd", ""));
        answers
    }
}

/// `{"<name>":{"host","port","type","req","acc"}}` for one record.
pub fn node_payload(record: &NodeRecord) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert(
        record.name.clone(),
        json!({
            "host": record.effective_host(),
            "port": record.effective_port(),
            "type": i64::from(record.role),
            "req": record.is_requested(),
            "acc": record.is_accepted(),
        }),
    );
    serde_json::Value::Object(payload).to_string()
}

#[async_trait]
impl BusHandler for CorePlugin {
    async fn on_message(&self, msg: &BusMessage) {
        let request = &msg.envelope;
        if request.command == "nodeNameGet" {
            self.plugin
                .publish_detached(vec![self.answer(request, "nodeName", &self.node_name)]);
            return;
        }
        if request.target_node != self.node_name {
            return;
        }

        match request.command.as_str() {
            "getNodes" => {
                self.plugin.publish_detached(self.node_answers(request));
            }
            "nodeDelete" => {
                let directory = Arc::clone(&self.directory);
                let plugin = self.plugin.clone();
                let name = request.payload.clone();
                let ok = self.answer(request, "nodeDeleteOk", &name);
                let failed = self.answer(request, "error", "");
                tokio::spawn(async move {
                    let answer = match directory.delete(&name).await {
                        Ok(_) => ok,
                        Err(e) => Envelope {
                            payload: e.to_string(),
                            ..failed
                        },
                    };
                    plugin.publish_detached(vec![answer]);
                });
            }
            "ping" => {
                let payload = request.payload.clone();
                self.plugin
                    .publish_detached(vec![self.answer(request, "pong", payload)]);
            }
            other => debug!(command = %other, "Ignoring core command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilot_bus::DEFAULT_QUEUE_CAPACITY;
    use copilot_directory::MemoryNodeStore;
    use copilot_types::NodeRole;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn setup() -> (Arc<NodeDirectory>, Plugin, UnboundedReceiver<BusMessage>) {
        let (bus, _worker) = MessageBus::start(DEFAULT_QUEUE_CAPACITY);
        let directory = Arc::new(NodeDirectory::new(Arc::new(MemoryNodeStore::new())));
        CorePlugin::register(&bus, "local", Arc::clone(&directory));
        let ui = bus.register_plugin("ui");
        let answers = ui.subscribe(CORE_GROUP);
        (directory, ui, answers)
    }

    async fn next(answers: &mut UnboundedReceiver<BusMessage>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), answers.recv())
            .await
            .expect("answer in time")
            .expect("bus alive")
            .envelope
    }

    #[test]
    fn test_node_payload_shape() {
        let record = NodeRecord::new("edge", NodeRole::Client, "", 0);
        let value: serde_json::Value = serde_json::from_str(&node_payload(&record)).unwrap();
        assert_eq!(value["edge"]["host"], "127.0.0.1");
        assert_eq!(value["edge"]["port"], 4444);
        assert_eq!(value["edge"]["type"], 2);
        assert_eq!(value["edge"]["req"], false);
        assert_eq!(value["edge"]["acc"], false);
    }

    #[tokio::test]
    async fn test_get_nodes_lists_every_record_then_ends() {
        let (directory, ui, mut answers) = setup().await;
        directory
            .set_endpoint("alpha", NodeRole::Server, "0.0.0.0", 4444)
            .await
            .unwrap();
        directory
            .set_endpoint("beta", NodeRole::Client, "10.0.0.2", 4445)
            .await
            .unwrap();

        ui.publish("ui", "local", CORE_GROUP, "getNodes", "")
            .await
            .unwrap();

        let first = next(&mut answers).await;
        assert_eq!(first.command, "node");
        assert_eq!(first.target_node, "ui");
        assert_eq!(first.source_node, "local");
        assert!(first.payload.contains("\"alpha\""));
        let second = next(&mut answers).await;
        assert!(second.payload.contains("\"beta\""));
        assert_eq!(next(&mut answers).await.command, "nodeEnd");
    }

    #[tokio::test]
    async fn test_node_name_answered_for_any_target() {
        let (_directory, ui, mut answers) = setup().await;
        ui.publish("ui", "", CORE_GROUP, "nodeNameGet", "")
            .await
            .unwrap();
        let answer = next(&mut answers).await;
        assert_eq!(answer.command, "nodeName");
        assert_eq!(answer.payload, "local");
        assert_eq!(answer.source_node, "local");
    }

    #[tokio::test]
    async fn test_ping_only_when_addressed_here() {
        let (_directory, ui, mut answers) = setup().await;
        ui.publish("ui", "elsewhere", CORE_GROUP, "ping", "one")
            .await
            .unwrap();
        ui.publish("ui", "local", CORE_GROUP, "ping", "two")
            .await
            .unwrap();
        let answer = next(&mut answers).await;
        assert_eq!(answer.command, "pong");
        assert_eq!(answer.payload, "two");
    }

    #[tokio::test]
    async fn test_node_delete() {
        let (directory, ui, mut answers) = setup().await;
        directory
            .set_endpoint("gone", NodeRole::IncomingPeer, "", 0)
            .await
            .unwrap();
        ui.publish("ui", "local", CORE_GROUP, "nodeDelete", "gone")
            .await
            .unwrap();
        let answer = next(&mut answers).await;
        assert_eq!(answer.command, "nodeDeleteOk");
        assert_eq!(answer.payload, "gone");
        assert!(directory.get("gone").unwrap().is_none());
    }
}
