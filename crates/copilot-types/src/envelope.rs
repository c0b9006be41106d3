//! The message envelope routed by the bus and carried over the wire.
//!
//! Field names are shortened on the wire (`s`, `t`, `g`, `c`, `v`) to keep
//! each line small. Bus-local metadata (sequence id, sending plugin) is not
//! part of the envelope; the bus wraps it separately.

use serde::{Deserialize, Serialize};

/// A routed message.
///
/// `group` and `command` together form the routing key. `payload` is opaque
/// to the fabric and is interpreted only by the receiving handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Name of the node the message originates from.
    #[serde(rename = "s", default)]
    pub source_node: String,
    /// Name of the node the message is addressed to (empty = untargeted).
    #[serde(rename = "t", default)]
    pub target_node: String,
    /// Coarse topic.
    #[serde(rename = "g", default)]
    pub group: String,
    /// Action or event name within the group.
    #[serde(rename = "c", default)]
    pub command: String,
    /// Opaque payload, usually JSON.
    #[serde(rename = "v", default)]
    pub payload: String,
}

impl Envelope {
    /// Build an envelope from its five routing fields.
    pub fn new(
        source_node: impl Into<String>,
        target_node: impl Into<String>,
        group: impl Into<String>,
        command: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            source_node: source_node.into(),
            target_node: target_node.into(),
            group: group.into(),
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Build the answer to this envelope: source and target swapped, same group.
    pub fn reply(&self, command: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            source_node: self.target_node.clone(),
            target_node: self.source_node.clone(),
            group: self.group.clone(),
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// True when the envelope names a target node.
    pub fn is_targeted(&self) -> bool {
        !self.target_node.is_empty()
    }

    /// Serialize to a compact JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
