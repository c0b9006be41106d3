//! Two kernels on loopback, configured only through the one-shot commands
//! and administered only over the bus.

use copilot_bus::BusMessage;
use copilot_kernel::commands;
use copilot_kernel::CopilotKernel;
use copilot_types::config::CopilotConfig;
use copilot_types::Envelope;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn node_config(name: &str, data_dir: &Path) -> CopilotConfig {
    let mut config = CopilotConfig {
        node_name: name.to_string(),
        data_dir: data_dir.to_path_buf(),
        ..CopilotConfig::default()
    };
    config.network.reconnect_backoff_secs = 1;
    config.network.handshake_timeout_secs = 5;
    config
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for(rx: &mut UnboundedReceiver<BusMessage>, command: &str) -> Envelope {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let msg = rx.recv().await.expect("bus alive");
            if msg.envelope.command == command {
                return msg.envelope;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {command} in time"))
}

// ---------------------------------------------------------------------------
// Full lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_nodes_pair_and_exchange_messages() {
    let hub_dir = tempfile::tempdir().unwrap();
    let edge_dir = tempfile::tempdir().unwrap();
    let hub_config = node_config("hub", hub_dir.path());
    let edge_config = node_config("edge", edge_dir.path());
    let port = free_port();

    let hub_directory = commands::open_directory(&hub_config);
    commands::serve(&hub_directory, "hub", &format!("127.0.0.1:{port}"))
        .await
        .unwrap();
    commands::allow_incoming(&hub_directory, "edge").await.unwrap();
    let edge_directory = commands::open_directory(&edge_config);
    commands::connect_to(&edge_directory, "hub", &format!("127.0.0.1:{port}"))
        .await
        .unwrap();

    let hub = CopilotKernel::boot(hub_config).await.unwrap();
    let edge = CopilotKernel::boot(edge_config).await.unwrap();

    let hub_ui = hub.bus.register_plugin("ui");
    let mut hub_tls = hub_ui.subscribe("tls");
    let edge_ui = edge.bus.register_plugin("ui");
    let mut edge_tls = edge_ui.subscribe("tls");
    let mut edge_co = edge_ui.subscribe("co");

    let bound = hub.start().await.unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].port(), port);
    assert!(edge.start().await.unwrap().is_empty());

    // Operator approves edge from the hub side.
    assert_eq!(wait_for(&mut hub_tls, "nodeReq").await.payload, "edge");
    hub_ui
        .publish("ui", "hub", "tls", "nodeAccept", "edge")
        .await
        .unwrap();
    let accepted = wait_for(&mut hub_tls, "nodeAcceptOk").await;
    assert_eq!(accepted.payload, "edge");
    assert_eq!(accepted.target_node, "ui");

    assert_eq!(wait_for(&mut edge_tls, "nodeConnected").await.payload, "hub");

    // Ask hub's core plugin something from edge.
    edge_ui
        .publish("edge", "hub", "co", "ping", "over the wire")
        .await
        .unwrap();
    let pong = wait_for(&mut edge_co, "pong").await;
    assert_eq!(pong.source_node, "hub");
    assert_eq!(pong.target_node, "edge");
    assert_eq!(pong.payload, "over the wire");

    // Trust material landed in both core.json documents.
    let on_hub = commands::open_directory(&hub.config)
        .get("edge")
        .unwrap()
        .unwrap();
    assert!(on_hub.is_accepted());
    assert!(on_hub.shared_secret().is_some());
    let on_edge = edge.directory.get("hub").unwrap().unwrap();
    assert_eq!(on_edge.shared_secret(), on_hub.shared_secret());

    tokio::time::timeout(Duration::from_secs(10), async {
        edge.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .expect("kernels stop");
}

#[tokio::test]
async fn test_boot_records_own_node_and_identity() {
    let dir = tempfile::tempdir().unwrap();
    let config = node_config("solo", dir.path());
    let kernel = CopilotKernel::boot(config.clone()).await.unwrap();

    assert!(kernel.directory.get("solo").unwrap().is_some());
    assert!(dir.path().join("core.json").exists());
    let identity = commands::identity(&config).unwrap();
    assert_eq!(identity.fingerprint(), kernel.wire.identity.fingerprint());

    // No server or client records: nothing to start.
    assert!(kernel.start().await.unwrap().is_empty());
    kernel.shutdown().await;
}
