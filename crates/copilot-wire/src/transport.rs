//! Transport — TLS listeners and reconnecting dialers.
//!
//! Server records get a listener whose every accepted connection runs an
//! incoming [`Session`]. Client records get a dial loop that runs one
//! outgoing session at a time and waits a fixed backoff between attempts.
//! All tasks stop when [`Transport::shutdown`] is called.

use crate::context::WireContext;
use crate::error::{WireError, WireResult};
use crate::session::{Session, SessionRole};
use crate::tls::PeerCertificate;
use copilot_types::NodeRole;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Owns the network tasks of one node.
pub struct Transport {
    ctx: Arc<WireContext>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(ctx: Arc<WireContext>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<WireContext> {
        &self.ctx
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Start a listener for every Server record and a dialer for every
    /// Client record. A listener that cannot bind is logged and skipped.
    ///
    /// Returns the addresses actually bound.
    pub async fn start(&self) -> WireResult<Vec<SocketAddr>> {
        let mut bound = Vec::new();
        for record in self.ctx.directory.list()? {
            match record.role {
                NodeRole::Server => match self.listen(&record.address()).await {
                    Ok(addr) => bound.push(addr),
                    Err(e) => {
                        error!(node = %record.name, addr = %record.address(), error = %e, "Listener failed to start");
                    }
                },
                NodeRole::Client => self.connect(&record.name),
                NodeRole::Undefined | NodeRole::IncomingPeer => {}
            }
        }
        Ok(bound)
    }

    /// Listen on `addr` and run an incoming session per connection.
    pub async fn listen(&self, addr: &str) -> WireResult<SocketAddr> {
        let acceptor = self.ctx.identity.acceptor()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, node = %self.ctx.node_name, "Serving TLS");

        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown_tx.subscribe();
        self.track(tokio::spawn(accept_loop(ctx, listener, acceptor, shutdown)));
        Ok(local_addr)
    }

    /// Keep dialing the Client record `node_name` until shutdown or until
    /// the record stops being a Client.
    pub fn connect(&self, node_name: &str) {
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown_tx.subscribe();
        self.track(tokio::spawn(connect_loop(
            ctx,
            node_name.to_string(),
            shutdown,
        )));
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("Transport stopped");
    }
}

/// Dial the record `node_name` once and run the session to completion.
pub async fn connect_once(ctx: &Arc<WireContext>, node_name: &str) -> WireResult<()> {
    let record = ctx
        .directory
        .get(node_name)?
        .ok_or_else(|| WireError::UnknownNode(node_name.to_string()))?;
    let addr = record.address();
    info!(peer = %node_name, addr = %addr, "Connecting");

    let tcp = TcpStream::connect(&addr).await?;
    let remote_addr = tcp.peer_addr().ok();
    let server_name = ServerName::try_from(record.effective_host().to_string())
        .map_err(|e| WireError::Tls(format!("invalid host '{}': {e}", record.effective_host())))?;
    let connector = ctx.identity.connector()?;
    let tls = tokio::time::timeout(
        ctx.config.handshake_timeout,
        connector.connect(server_name, tcp),
    )
    .await
    .map_err(|_| WireError::Timeout("TLS handshake"))??;

    let peer = PeerCertificate::from_chain(tls.get_ref().1.peer_certificates())?;
    let mut session = Session::new(Arc::clone(ctx), SessionRole::Outgoing, peer).dialed(node_name);
    if let Some(addr) = remote_addr {
        session = session.with_remote_addr(addr);
    }
    session.run(tls).await
}

async fn connect_loop(ctx: Arc<WireContext>, node_name: String, mut shutdown: watch::Receiver<bool>) {
    loop {
        match ctx.directory.get(&node_name) {
            Ok(Some(record)) if record.role == NodeRole::Client => {}
            Ok(_) => {
                info!(peer = %node_name, "No longer a client node; dialer stopped");
                return;
            }
            Err(e) => warn!(peer = %node_name, error = %e, "Could not read node record"),
        }

        tokio::select! {
            result = connect_once(&ctx, &node_name) => match result {
                Ok(()) => debug!(peer = %node_name, "Session ended"),
                Err(e) => warn!(peer = %node_name, error = %e, "Connection attempt ended"),
            },
            _ = shutdown.changed() => return,
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.config.reconnect_backoff) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn accept_loop(
    ctx: Arc<WireContext>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => {
                    debug!(addr = %addr, "Accepted connection");
                    let ctx = Arc::clone(&ctx);
                    let acceptor = acceptor.clone();
                    let mut session_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_incoming(ctx, acceptor, tcp, addr) => {
                                if let Err(e) = result {
                                    debug!(addr = %addr, error = %e, "Incoming connection ended");
                                }
                            }
                            _ = session_shutdown.changed() => {}
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Listener stopped");
}

async fn handle_incoming(
    ctx: Arc<WireContext>,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    addr: SocketAddr,
) -> WireResult<()> {
    let tls = tokio::time::timeout(ctx.config.handshake_timeout, acceptor.accept(tcp))
        .await
        .map_err(|_| WireError::Timeout("TLS handshake"))??;
    let peer = PeerCertificate::from_chain(tls.get_ref().1.peer_certificates())?;
    Session::new(ctx, SessionRole::Incoming, peer)
        .with_remote_addr(addr)
        .run(tls)
        .await
}
