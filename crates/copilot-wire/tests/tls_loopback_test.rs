//! End-to-end tests over real TLS on the loopback interface.
//!
//! Two nodes, "hub" (listens) and "edge" (dials), each with its own bus,
//! in-memory directory and freshly generated certificate.

use copilot_bus::{BusMessage, MessageBus, DEFAULT_QUEUE_CAPACITY};
use copilot_directory::{MemoryNodeStore, NodeDirectory};
use copilot_types::{Envelope, NodeRole};
use copilot_wire::message::{EVT_NODE_CONNECTED, EVT_NODE_DISCONNECT, EVT_NODE_REQ, TLS_GROUP};
use copilot_wire::transport::connect_once;
use copilot_wire::{TlsIdentity, Transport, WireConfig, WireContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Node {
    ctx: Arc<WireContext>,
    transport: Transport,
    events: UnboundedReceiver<BusMessage>,
}

fn fast_config() -> WireConfig {
    WireConfig {
        reconnect_backoff: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        idle_timeout: None,
        allow_unknown_peers: false,
    }
}

fn node(name: &str) -> Node {
    node_with_identity(TlsIdentity::generate(name).unwrap())
}

fn node_with_identity(identity: TlsIdentity) -> Node {
    let (bus, _worker) = MessageBus::start(DEFAULT_QUEUE_CAPACITY);
    let directory = Arc::new(NodeDirectory::new(Arc::new(MemoryNodeStore::new())));
    let events = bus.register_plugin("observer").subscribe(TLS_GROUP);
    let ctx = WireContext::new(bus, directory, Arc::new(identity), fast_config());
    Node {
        transport: Transport::new(Arc::clone(&ctx)),
        ctx,
        events,
    }
}

/// Wait for the next lifecycle event with `command`, skipping others.
async fn wait_for(node: &mut Node, command: &str) -> Envelope {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let msg = node.events.recv().await.expect("bus alive");
            if msg.envelope.command == command {
                return msg.envelope;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {command} event in time"))
}

/// Hub listening on an ephemeral port and knowing edge; edge configured
/// to dial hub there.
async fn hub_and_edge() -> (Node, Node) {
    let hub = node("hub");
    let edge = node("edge");
    let addr = hub.transport.listen("127.0.0.1:0").await.unwrap();
    hub.ctx
        .directory
        .set_endpoint("edge", NodeRole::IncomingPeer, "", 0)
        .await
        .unwrap();
    edge.ctx
        .directory
        .set_endpoint("hub", NodeRole::Client, "127.0.0.1", addr.port())
        .await
        .unwrap();
    (hub, edge)
}

// ---------------------------------------------------------------------------
// Trust on first use, approval, and relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_first_contact_then_approval_then_relay() {
    let (mut hub, mut edge) = hub_and_edge().await;

    // First attempt: hub has never seen edge's certificate.
    assert!(connect_once(&edge.ctx, "hub").await.is_err());
    let request = wait_for(&mut hub, EVT_NODE_REQ).await;
    assert_eq!(request.payload, "edge");
    assert_eq!(request.source_node, "hub");

    let hub_record = edge.ctx.directory.get("hub").unwrap().unwrap();
    assert_eq!(
        hub_record.pinned_fingerprint(),
        Some(hub.ctx.identity.fingerprint())
    );
    let pending = hub.ctx.directory.get("edge").unwrap().unwrap();
    assert_eq!(
        pending.pending_fingerprint(),
        Some(edge.ctx.identity.fingerprint())
    );

    hub.ctx.directory.accept_pending("edge").await.unwrap();

    let edge_ctx = Arc::clone(&edge.ctx);
    let session = tokio::spawn(async move { connect_once(&edge_ctx, "hub").await });
    assert_eq!(wait_for(&mut hub, EVT_NODE_CONNECTED).await.payload, "edge");
    assert_eq!(wait_for(&mut edge, EVT_NODE_CONNECTED).await.payload, "hub");

    // Both sides now share the same secret.
    let on_hub = hub.ctx.directory.get("edge").unwrap().unwrap();
    let on_edge = edge.ctx.directory.get("hub").unwrap().unwrap();
    assert!(on_hub.shared_secret().is_some());
    assert_eq!(on_hub.shared_secret(), on_edge.shared_secret());
    assert!(hub.ctx.peers.is_connected("edge"));

    // An envelope addressed to hub crosses the link.
    let mut inbox = hub.ctx.bus.register_plugin("probe").subscribe("co");
    let sender = edge.ctx.bus.register_plugin("ui");
    sender
        .publish("edge", "hub", "co", "ping", "hello")
        .await
        .unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
        .await
        .expect("relayed in time")
        .expect("bus alive");
    assert_eq!(delivered.envelope.command, "ping");
    assert_eq!(delivered.envelope.payload, "hello");
    assert_eq!(delivered.envelope.source_node, "edge");

    // Dropping edge's side ends hub's session.
    session.abort();
    assert_eq!(wait_for(&mut hub, EVT_NODE_DISCONNECT).await.payload, "edge");
    assert!(!hub.ctx.peers.is_connected("edge"));

    hub.transport.shutdown().await;
}

#[tokio::test]
async fn test_impostor_with_same_name_is_refused() {
    let (hub, edge) = hub_and_edge().await;
    hub.ctx
        .directory
        .update("edge", |r| {
            r.pin("fingerprint-of-the-real-edge");
            Ok(())
        })
        .await
        .unwrap();

    let impostor = node_with_identity(TlsIdentity::generate("edge").unwrap());
    impostor
        .ctx
        .directory
        .set_endpoint(
            "hub",
            NodeRole::Client,
            "127.0.0.1",
            edge.ctx.directory.get("hub").unwrap().unwrap().port,
        )
        .await
        .unwrap();

    assert!(connect_once(&impostor.ctx, "hub").await.is_err());
    let record = hub.ctx.directory.get("edge").unwrap().unwrap();
    assert_eq!(
        record.pinned_fingerprint(),
        Some("fingerprint-of-the-real-edge")
    );
    assert!(record.pending_fingerprint().is_none());
    assert_eq!(hub.ctx.peers.count(), 0);

    hub.transport.shutdown().await;
}

// ---------------------------------------------------------------------------
// Transport driven by directory records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dialer_retries_until_accepted_and_stops_on_shutdown() {
    let mut hub = node("hub");
    let mut edge = node("edge");
    // Port zero means "default" in a record, so reserve a free one.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    hub.ctx
        .directory
        .set_endpoint("hub", NodeRole::Server, "127.0.0.1", port)
        .await
        .unwrap();
    hub.ctx
        .directory
        .set_endpoint("edge", NodeRole::IncomingPeer, "", 0)
        .await
        .unwrap();
    let bound = hub.transport.start().await.unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].port(), port);

    edge.ctx
        .directory
        .set_endpoint("hub", NodeRole::Client, "127.0.0.1", bound[0].port())
        .await
        .unwrap();
    assert!(edge.transport.start().await.unwrap().is_empty());

    wait_for(&mut hub, EVT_NODE_REQ).await;
    hub.ctx.directory.accept_pending("edge").await.unwrap();

    // The next retry gets through.
    assert_eq!(wait_for(&mut edge, EVT_NODE_CONNECTED).await.payload, "hub");

    tokio::time::timeout(Duration::from_secs(10), async {
        edge.transport.shutdown().await;
        hub.transport.shutdown().await;
    })
    .await
    .expect("transports stop");
}
