//! `tls` group commands: trust administration over the bus.
//!
//! | command      | payload                          | answer         |
//! |--------------|----------------------------------|----------------|
//! | `nodeAccept` | node name                        | `nodeAcceptOk` |
//! | `nodeReject` | node name                        | `nodeRejectOk` |
//! | `nodeAdd`    | `{"name","host","port"}`         | `nodeAddOk`    |
//! | `nodeDelete` | node name                        | `nodeDeleteOk` |
//!
//! Failures are answered with command `error` and the reason as payload.

use crate::context::WireContext;
use crate::error::WireError;
use crate::message::*;
use async_trait::async_trait;
use copilot_bus::{BusHandler, BusMessage};
use copilot_types::{Envelope, NodeRole};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct NodeAdd {
    name: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: u16,
}

/// Listener for the `tls` group.
pub struct AdminHandler {
    ctx: Arc<WireContext>,
}

impl AdminHandler {
    /// Listen for `tls` commands on the context's plugin identity.
    pub fn register(ctx: &Arc<WireContext>) {
        ctx.plugin.listen(
            TLS_GROUP,
            Arc::new(Self {
                ctx: Arc::clone(ctx),
            }),
        );
    }
}

#[async_trait]
impl BusHandler for AdminHandler {
    async fn on_message(&self, msg: &BusMessage) {
        let request = &msg.envelope;
        if request.is_targeted() && request.target_node != self.ctx.node_name {
            return;
        }
        if !matches!(
            request.command.as_str(),
            CMD_NODE_ACCEPT | CMD_NODE_REJECT | CMD_NODE_ADD | CMD_NODE_DELETE
        ) {
            return;
        }

        // Directory updates wait on per-node locks; keep them off the
        // dispatch worker.
        let ctx = Arc::clone(&self.ctx);
        let request = request.clone();
        tokio::spawn(async move {
            let answer = execute(&ctx, &request).await;
            if let Err(e) = ctx.plugin.publish_envelope(answer).await {
                warn!(command = %request.command, error = %e, "Could not answer admin command");
            }
        });
    }
}

/// Run one admin command and build its answer.
pub async fn execute(ctx: &WireContext, request: &Envelope) -> Envelope {
    let directory = &ctx.directory;
    let name = request.payload.as_str();
    let outcome: Result<(&str, String), WireError> = match request.command.as_str() {
        CMD_NODE_ACCEPT => directory
            .accept_pending(name)
            .await
            .map(|_| ("nodeAcceptOk", name.to_string()))
            .map_err(Into::into),
        CMD_NODE_REJECT => directory
            .forget(name)
            .await
            .map(|_| ("nodeRejectOk", name.to_string()))
            .map_err(Into::into),
        CMD_NODE_ADD => match serde_json::from_str::<NodeAdd>(&request.payload) {
            Ok(add) if !add.name.is_empty() => directory
                .set_endpoint(&add.name, NodeRole::IncomingPeer, &add.host, add.port)
                .await
                .map(|_| ("nodeAddOk", add.name))
                .map_err(Into::into),
            Ok(_) => Err(WireError::InvalidPayload("nodeAdd needs a node name".into())),
            Err(e) => Err(WireError::InvalidPayload(format!("nodeAdd: {e}"))),
        },
        CMD_NODE_DELETE => directory
            .delete(name)
            .await
            .map(|_| ("nodeDeleteOk", name.to_string()))
            .map_err(Into::into),
        other => Err(WireError::UnexpectedCommand {
            phase: "administration",
            command: other.to_string(),
        }),
    };

    let mut answer = match outcome {
        Ok((command, payload)) => {
            debug!(command = %request.command, node = %payload, "Admin command done");
            request.reply(command, payload)
        }
        Err(e) => {
            warn!(command = %request.command, error = %e, "Admin command failed");
            request.reply(CMD_ERROR, e.to_string())
        }
    };
    if answer.source_node.is_empty() {
        answer.source_node = ctx.node_name.clone();
    }
    answer
}
