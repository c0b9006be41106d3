//! Session — one authenticated link between two nodes.
//!
//! The TLS handshake happens in [`crate::transport`]; a session starts with
//! the handshake done and the peer certificate in hand, then walks:
//!
//! ```text
//! HandshakeOk -> CertCheck -> [SecretBootstrap] -> Challenge -> Established -> Relay -> Closed
//! ```
//!
//! Any failure before Established closes the session with the reason as a
//! [`WireError`]. Every read and write before Established is bounded by the
//! handshake timeout.

use crate::context::WireContext;
use crate::error::{WireError, WireResult};
use crate::message::*;
use crate::registry::PeerEntry;
use crate::tls::PeerCertificate;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use copilot_bus::{BusHandler, BusMessage, Plugin};
use copilot_directory::CertCheck;
use copilot_types::Envelope;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// The peer connected to our listener.
    Incoming,
    /// We dialed the peer.
    Outgoing,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    HandshakeOk,
    CertCheck,
    SecretBootstrap,
    Challenge,
    Established,
    Relay,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::HandshakeOk => "handshake",
            Self::CertCheck => "certificate check",
            Self::SecretBootstrap => "secret bootstrap",
            Self::Challenge => "challenge",
            Self::Established => "established",
            Self::Relay => "relay",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 32 random bytes, standard base64. Used for secrets and nonces.
pub fn generate_token() -> String {
    let mut bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(bytes.as_mut());
    BASE64.encode(bytes.as_ref())
}

/// HMAC-SHA256 of `message` keyed with `secret`, standard base64.
pub fn compute_hmac(message: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(message.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Check a challenge response using constant-time comparison.
pub fn verify_hmac(message: &str, secret: &str, response: &str) -> bool {
    let expected = compute_hmac(message, secret);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), response.as_bytes()).into()
}

/// Whether an envelope on the local bus should go out over a session.
///
/// Only envelopes addressed to some other node leave the process.
pub fn should_forward(envelope: &Envelope, local_node: &str) -> bool {
    !envelope.target_node.is_empty() && envelope.target_node != local_node
}

/// Bus listener that queues outbound envelopes for one session's writer.
struct ForwardHandler {
    local_node: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl BusHandler for ForwardHandler {
    async fn on_message(&self, msg: &BusMessage) {
        if should_forward(&msg.envelope, &self.local_node) {
            // Closed channel: the session is shutting down.
            let _ = self.tx.send(msg.envelope.clone());
        }
    }
}

/// Undoes a session's bus registration and live-peer entry, including
/// when the session task is aborted.
struct RelayGuard {
    plugin: Plugin,
    ctx: Arc<WireContext>,
    label: String,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.plugin.deregister();
        self.ctx.peers.remove(&self.label);
    }
}

/// One connection's protocol state machine.
pub struct Session {
    ctx: Arc<WireContext>,
    role: SessionRole,
    label: String,
    peer: PeerCertificate,
    dialed: Option<String>,
    remote_addr: Option<SocketAddr>,
    state: SessionState,
}

impl Session {
    /// A session whose TLS handshake has completed.
    pub fn new(ctx: Arc<WireContext>, role: SessionRole, peer: PeerCertificate) -> Self {
        let label = ctx.next_session_label();
        Self {
            ctx,
            role,
            label,
            peer,
            dialed: None,
            remote_addr: None,
            state: SessionState::HandshakeOk,
        }
    }

    /// The node we meant to reach; the certificate must name it.
    pub fn dialed(mut self, node_name: impl Into<String>) -> Self {
        self.dialed = Some(node_name.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &PeerCertificate {
        &self.peer
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            session = %self.label,
            peer = %self.peer.common_name,
            from = %self.state,
            to = %next,
            "Session state"
        );
        self.state = next;
    }

    /// Drive the session to completion over `stream`.
    ///
    /// Returns `Ok` when an established session ends because the peer closed
    /// the connection, otherwise the reason it was closed.
    pub async fn run<S>(mut self, stream: S) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut io = BufReader::new(stream);
        let mut established = false;
        let result = match self.negotiate(&mut io).await {
            Ok(()) => self.relay(io, &mut established).await,
            Err(e) => Err(e),
        };

        if established {
            let node = self.ctx.node_name.clone();
            if let Err(e) = self
                .ctx
                .plugin
                .publish(&node, &node, TLS_GROUP, EVT_NODE_DISCONNECT, &self.peer.common_name)
                .await
            {
                warn!(session = %self.label, error = %e, "Could not publish disconnect");
            }
        }
        self.transition(SessionState::Closed);

        match &result {
            Ok(()) => info!(session = %self.label, peer = %self.peer.common_name, "Session closed"),
            Err(e) => info!(
                session = %self.label,
                peer = %self.peer.common_name,
                reason = %e,
                "Session closed"
            ),
        }
        result
    }

    /// Everything between the TLS handshake and Established.
    async fn negotiate<S>(&mut self, io: &mut BufReader<S>) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(SessionState::CertCheck);
        let secret = match self.check_certificate().await? {
            Some(secret) => secret,
            None => {
                self.transition(SessionState::SecretBootstrap);
                self.bootstrap_secret(io).await?
            }
        };

        self.transition(SessionState::Challenge);
        self.challenge(io, &secret).await?;

        Ok(())
    }

    /// Decide whether the presented certificate is trusted. Returns the
    /// shared secret when one already exists.
    async fn check_certificate(&mut self) -> WireResult<Option<Zeroizing<String>>> {
        let name = self.peer.common_name.clone();
        if let Some(expected) = &self.dialed {
            if *expected != name {
                return Err(WireError::NameMismatch {
                    expected: expected.clone(),
                    presented: name,
                });
            }
        }

        let directory = &self.ctx.directory;
        let fingerprint = &self.peer.fingerprint;
        let check = match self.role {
            SessionRole::Incoming => {
                directory
                    .check_incoming(&name, fingerprint, self.ctx.config.allow_unknown_peers)
                    .await?
            }
            SessionRole::Outgoing => directory.check_outgoing(&name, fingerprint).await?,
        };

        match check {
            CertCheck::Trusted { shared_secret } => Ok(shared_secret.map(Zeroizing::new)),
            CertCheck::PendingApproval => {
                let node = self.ctx.node_name.clone();
                self.ctx
                    .plugin
                    .publish(&node, &node, TLS_GROUP, EVT_NODE_REQ, &name)
                    .await?;
                Err(WireError::AwaitingApproval(name))
            }
            CertCheck::Mismatch => Err(WireError::FingerprintMismatch(name)),
            CertCheck::UnknownNode => Err(WireError::UnknownNode(name)),
        }
    }

    /// First contact: the incoming side hands out a fresh secret.
    async fn bootstrap_secret<S>(&mut self, io: &mut BufReader<S>) -> WireResult<Zeroizing<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.peer.common_name.clone();
        match self.role {
            SessionRole::Incoming => {
                let secret = Zeroizing::new(generate_token());
                self.send(io, CMD_NEW_SECRET, &secret).await?;
                let reply = self.recv(io).await?;
                self.expect_command(&reply, CMD_NEW_SECRET_SAVED)?;
                // Persist only once the peer has it, and only if no one
                // rejected the peer in the meantime.
                if !self
                    .ctx
                    .directory
                    .store_secret(&name, &self.peer.fingerprint, &secret)
                    .await?
                {
                    return Err(WireError::TrustChanged(name));
                }
                info!(session = %self.label, peer = %name, "Shared secret issued");
                Ok(secret)
            }
            SessionRole::Outgoing => {
                let offer = self.recv(io).await?;
                self.expect_command(&offer, CMD_NEW_SECRET)?;
                let secret = Zeroizing::new(offer.payload);
                if secret.is_empty() {
                    return Err(WireError::InvalidSecret(name));
                }
                if !self
                    .ctx
                    .directory
                    .store_secret(&name, &self.peer.fingerprint, &secret)
                    .await?
                {
                    return Err(WireError::TrustChanged(name));
                }
                self.send(io, CMD_NEW_SECRET_SAVED, "").await?;
                info!(session = %self.label, peer = %name, "Shared secret received");
                Ok(secret)
            }
        }
    }

    /// Mutual proof of secret possession. Both directions must succeed.
    async fn challenge<S>(&mut self, io: &mut BufReader<S>, secret: &str) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let nonce = generate_token();
        self.send(io, CMD_CHALLENGE_REQUEST, &nonce).await?;

        let mut answered = false;
        let mut verified = false;
        while !(answered && verified) {
            let msg = self.recv(io).await?;
            if msg.group != CHALLENGE_GROUP {
                return Err(self.unexpected(&msg));
            }
            match msg.command.as_str() {
                CMD_CHALLENGE_REQUEST if !answered => {
                    let response = compute_hmac(&msg.payload, secret);
                    self.send(io, CMD_CHALLENGE_RESPONSE, &response).await?;
                    answered = true;
                }
                CMD_CHALLENGE_RESPONSE if !verified => {
                    if !verify_hmac(&nonce, secret, &msg.payload) {
                        return Err(WireError::ChallengeFailed(self.peer.common_name.clone()));
                    }
                    verified = true;
                }
                _ => return Err(self.unexpected(&msg)),
            }
        }
        debug!(session = %self.label, "Challenge passed");
        Ok(())
    }

    /// Announce the session, then bridge the socket and the bus until
    /// either side ends.
    async fn relay<S>(&mut self, io: BufReader<S>, established: &mut bool) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Listen before announcing, so nothing published in reaction to
        // nodeConnected can miss the session.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = RelayGuard {
            plugin: self.ctx.bus.register_plugin(&self.label),
            ctx: Arc::clone(&self.ctx),
            label: self.label.clone(),
        };
        guard.plugin.listen(
            "",
            Arc::new(ForwardHandler {
                local_node: self.ctx.node_name.clone(),
                tx,
            }),
        );

        self.transition(SessionState::Established);
        self.ctx.peers.add(PeerEntry {
            node_name: self.peer.common_name.clone(),
            role: self.role,
            remote_addr: self.remote_addr,
            session: self.label.clone(),
            connected_at: chrono::Utc::now(),
        });
        let node = self.ctx.node_name.clone();
        self.ctx
            .plugin
            .publish(&node, &node, TLS_GROUP, EVT_NODE_CONNECTED, &self.peer.common_name)
            .await?;
        *established = true;
        info!(
            session = %self.label,
            peer = %self.peer.common_name,
            role = %self.role,
            "Session established"
        );

        self.transition(SessionState::Relay);
        let (read_half, mut write_half) = tokio::io::split(io);
        let write_timeout = self.ctx.config.write_timeout;
        let label = self.label.as_str();
        let writing = async {
            while let Some(envelope) = rx.recv().await {
                debug!(
                    session = %label,
                    target = %envelope.target_node,
                    command = %envelope.command,
                    "Forwarding"
                );
                let write = write_envelope(&mut write_half, &envelope);
                match tokio::time::timeout(write_timeout, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(WireError::Timeout("relay write")),
                }
            }
            Ok(())
        };

        let idle_timeout = self.ctx.config.idle_timeout;
        let mut reader = BufReader::new(read_half);
        let plugin = &guard.plugin;
        let reading = async {
            loop {
                let next = match idle_timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, read_envelope(&mut reader)).await {
                            Ok(next) => next,
                            Err(_) => return Err(WireError::Timeout("relay read")),
                        }
                    }
                    None => read_envelope(&mut reader).await,
                };
                match next {
                    Ok(envelope) => {
                        plugin.publish_envelope(envelope).await?;
                    }
                    Err(WireError::ConnectionClosed) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        };

        tokio::select! {
            r = reading => r,
            w = writing => w,
        }
    }

    async fn send<S>(&self, io: &mut BufReader<S>, command: &str, payload: &str) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let envelope = Envelope::new(
            &self.ctx.node_name,
            &self.peer.common_name,
            CHALLENGE_GROUP,
            command,
            payload,
        );
        self.bounded(write_envelope(io, &envelope)).await
    }

    async fn recv<S>(&self, io: &mut BufReader<S>) -> WireResult<Envelope>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.bounded(read_envelope(io)).await
    }

    async fn bounded<T>(&self, fut: impl Future<Output = WireResult<T>>) -> WireResult<T> {
        tokio::time::timeout(self.ctx.config.handshake_timeout, fut)
            .await
            .map_err(|_| WireError::Timeout(self.state.as_str()))?
    }

    fn expect_command(&self, msg: &Envelope, command: &str) -> WireResult<()> {
        if msg.group == CHALLENGE_GROUP && msg.command == command {
            Ok(())
        } else {
            Err(self.unexpected(msg))
        }
    }

    fn unexpected(&self, msg: &Envelope) -> WireError {
        warn!(
            session = %self.label,
            peer = %self.peer.common_name,
            group = %msg.group,
            command = %msg.command,
            "Unexpected command"
        );
        WireError::UnexpectedCommand {
            phase: self.state.as_str(),
            command: msg.command.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WireConfig;
    use crate::tls::TlsIdentity;
    use copilot_bus::{MessageBus, DEFAULT_QUEUE_CAPACITY};
    use copilot_directory::{MemoryNodeStore, NodeDirectory};
    use copilot_types::NodeRole;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    struct TestNode {
        ctx: Arc<WireContext>,
        events: mpsc::UnboundedReceiver<BusMessage>,
    }

    fn test_config() -> WireConfig {
        WireConfig {
            reconnect_backoff: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_timeout: None,
            allow_unknown_peers: false,
        }
    }

    fn test_node(name: &str, config: WireConfig) -> TestNode {
        let (bus, _worker) = MessageBus::start(DEFAULT_QUEUE_CAPACITY);
        let directory = Arc::new(NodeDirectory::new(Arc::new(MemoryNodeStore::new())));
        let identity = Arc::new(TlsIdentity::generate(name).unwrap());
        let events = bus.register_plugin("observer").subscribe(TLS_GROUP);
        TestNode {
            ctx: WireContext::new(bus, directory, identity, config),
            events,
        }
    }

    fn cert(name: &str, fingerprint: &str) -> PeerCertificate {
        PeerCertificate {
            common_name: name.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    async fn next_event(node: &mut TestNode) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), node.events.recv())
            .await
            .expect("event in time")
            .expect("bus alive")
            .envelope
    }

    /// "alpha" serves, "beta" dials. alpha has already accepted beta's
    /// certificate; beta has never seen alpha.
    async fn trusted_pair() -> (TestNode, TestNode) {
        let alpha = test_node("alpha", test_config());
        let beta = test_node("beta", test_config());
        alpha
            .ctx
            .directory
            .set_endpoint("beta", NodeRole::IncomingPeer, "", 0)
            .await
            .unwrap();
        alpha
            .ctx
            .directory
            .update("beta", |r| {
                r.pin("fp-beta");
                Ok(())
            })
            .await
            .unwrap();
        beta.ctx
            .directory
            .set_endpoint("alpha", NodeRole::Client, "127.0.0.1", 4444)
            .await
            .unwrap();
        (alpha, beta)
    }

    fn start_pair(
        alpha: &TestNode,
        beta: &TestNode,
    ) -> (
        tokio::task::JoinHandle<WireResult<()>>,
        tokio::task::JoinHandle<WireResult<()>>,
    ) {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let incoming = Session::new(
            Arc::clone(&alpha.ctx),
            SessionRole::Incoming,
            cert("beta", "fp-beta"),
        );
        let outgoing = Session::new(
            Arc::clone(&beta.ctx),
            SessionRole::Outgoing,
            cert("alpha", "fp-alpha"),
        )
        .dialed("alpha");
        (
            tokio::spawn(incoming.run(a_io)),
            tokio::spawn(outgoing.run(b_io)),
        )
    }

    #[test]
    fn test_hmac_known_vector() {
        assert_eq!(
            compute_hmac("The quick brown fox jumps over the lazy dog", "key"),
            "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg="
        );
        assert!(verify_hmac(
            "The quick brown fox jumps over the lazy dog",
            "key",
            "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg="
        ));
        assert!(!verify_hmac("nonce", "key", "bm90IGl0"));
    }

    #[test]
    fn test_tokens_are_32_random_bytes() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn test_should_forward() {
        let env = |target: &str| Envelope::new("me", target, "co", "ping", "");
        assert!(should_forward(&env("other"), "me"));
        assert!(!should_forward(&env("me"), "me"));
        assert!(!should_forward(&env(""), "me"));
    }

    #[tokio::test]
    async fn test_bootstrap_challenge_and_relay() {
        let (mut alpha, mut beta) = trusted_pair().await;
        let (alpha_task, beta_task) = start_pair(&alpha, &beta);

        let connected = next_event(&mut alpha).await;
        assert_eq!(connected.command, EVT_NODE_CONNECTED);
        assert_eq!(connected.payload, "beta");
        assert_eq!(connected.source_node, "alpha");
        assert_eq!(connected.target_node, "alpha");
        assert_eq!(next_event(&mut beta).await.command, EVT_NODE_CONNECTED);

        // Both sides hold the same freshly issued secret.
        let a_secret = alpha.ctx.directory.get("beta").unwrap().unwrap();
        let b_record = beta.ctx.directory.get("alpha").unwrap().unwrap();
        assert!(a_secret.shared_secret().is_some());
        assert_eq!(a_secret.shared_secret(), b_record.shared_secret());
        assert_eq!(b_record.pinned_fingerprint(), Some("fp-alpha"));
        assert!(alpha.ctx.peers.is_connected("beta"));
        assert!(beta.ctx.peers.is_connected("alpha"));

        // Relay: local and untargeted envelopes stay home.
        let probe = alpha.ctx.bus.register_plugin("probe");
        let mut received = probe.subscribe("co");
        let sender = beta.ctx.bus.register_plugin("sender");
        sender.publish("beta", "beta", "co", "local", "").await.unwrap();
        sender.publish("beta", "", "co", "broadcast", "").await.unwrap();
        sender.publish("beta", "alpha", "co", "ping", "hello").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.envelope.command, "ping");
        assert_eq!(msg.envelope.payload, "hello");
        assert_eq!(msg.envelope.source_node, "beta");
        assert!(msg.sender.starts_with("SESSION-"));

        // Dropping beta's side ends alpha's relay cleanly.
        beta_task.abort();
        let _ = beta_task.await;
        assert!(alpha_task.await.unwrap().is_ok());
        assert_eq!(next_event(&mut alpha).await.command, EVT_NODE_DISCONNECT);
        assert!(!alpha.ctx.peers.is_connected("beta"));
    }

    #[tokio::test]
    async fn test_existing_secret_skips_bootstrap() {
        let (mut alpha, mut beta) = trusted_pair().await;
        beta.ctx
            .directory
            .update("alpha", |r| {
                r.pin("fp-alpha");
                r.set_shared_secret("c2hhcmVk");
                Ok(())
            })
            .await
            .unwrap();
        alpha
            .ctx
            .directory
            .update("beta", |r| {
                r.set_shared_secret("c2hhcmVk");
                Ok(())
            })
            .await
            .unwrap();

        let (_a, _b) = start_pair(&alpha, &beta);
        assert_eq!(next_event(&mut alpha).await.command, EVT_NODE_CONNECTED);
        assert_eq!(next_event(&mut beta).await.command, EVT_NODE_CONNECTED);
        let record = alpha.ctx.directory.get("beta").unwrap().unwrap();
        assert_eq!(record.shared_secret(), Some("c2hhcmVk"));
    }

    #[tokio::test]
    async fn test_mismatched_secrets_never_establish() {
        let (alpha, beta) = trusted_pair().await;
        alpha
            .ctx
            .directory
            .update("beta", |r| {
                r.set_shared_secret("YWxwaGE=");
                Ok(())
            })
            .await
            .unwrap();
        beta.ctx
            .directory
            .update("alpha", |r| {
                r.pin("fp-alpha");
                r.set_shared_secret("YmV0YQ==");
                Ok(())
            })
            .await
            .unwrap();

        let (a, b) = start_pair(&alpha, &beta);
        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        assert_eq!(alpha.ctx.peers.count(), 0);
        assert_eq!(beta.ctx.peers.count(), 0);
    }

    #[tokio::test]
    async fn test_first_incoming_contact_awaits_approval() {
        let mut alpha = test_node("alpha", test_config());
        alpha
            .ctx
            .directory
            .set_endpoint("beta", NodeRole::IncomingPeer, "", 0)
            .await
            .unwrap();

        let (a_io, _b_io) = tokio::io::duplex(1024);
        let session = Session::new(
            Arc::clone(&alpha.ctx),
            SessionRole::Incoming,
            cert("beta", "fp-beta"),
        );
        let result = session.run(a_io).await;
        assert!(matches!(result, Err(WireError::AwaitingApproval(ref n)) if n == "beta"));

        let req = next_event(&mut alpha).await;
        assert_eq!(req.command, EVT_NODE_REQ);
        assert_eq!(req.payload, "beta");
        let record = alpha.ctx.directory.get("beta").unwrap().unwrap();
        assert_eq!(record.pending_fingerprint(), Some("fp-beta"));
        assert!(!record.is_accepted());
    }

    #[tokio::test]
    async fn test_pinned_mismatch_is_rejected() {
        let (alpha, _beta) = trusted_pair().await;
        let (a_io, _b_io) = tokio::io::duplex(1024);
        let session = Session::new(
            Arc::clone(&alpha.ctx),
            SessionRole::Incoming,
            cert("beta", "fp-impostor"),
        );
        assert!(matches!(
            session.run(a_io).await,
            Err(WireError::FingerprintMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_incoming_node() {
        let alpha = test_node("alpha", test_config());
        let (a_io, _b_io) = tokio::io::duplex(1024);
        let session = Session::new(
            Arc::clone(&alpha.ctx),
            SessionRole::Incoming,
            cert("stranger", "fp"),
        );
        assert!(matches!(
            session.run(a_io).await,
            Err(WireError::UnknownNode(_))
        ));
        assert!(alpha.ctx.directory.get("stranger").unwrap().is_none());

        let open = test_node(
            "alpha",
            WireConfig {
                allow_unknown_peers: true,
                ..test_config()
            },
        );
        let (a_io, _b_io) = tokio::io::duplex(1024);
        let session = Session::new(
            Arc::clone(&open.ctx),
            SessionRole::Incoming,
            cert("stranger", "fp"),
        );
        assert!(matches!(
            session.run(a_io).await,
            Err(WireError::AwaitingApproval(_))
        ));
        let record = open.ctx.directory.get("stranger").unwrap().unwrap();
        assert_eq!(record.role, NodeRole::IncomingPeer);
    }

    #[tokio::test]
    async fn test_dialed_name_must_match_certificate() {
        let (_alpha, beta) = trusted_pair().await;
        let (b_io, _a_io) = tokio::io::duplex(1024);
        let session = Session::new(
            Arc::clone(&beta.ctx),
            SessionRole::Outgoing,
            cert("mallory", "fp-mallory"),
        )
        .dialed("alpha");
        assert!(matches!(
            session.run(b_io).await,
            Err(WireError::NameMismatch { .. })
        ));
        let record = beta.ctx.directory.get("alpha").unwrap().unwrap();
        assert!(!record.is_accepted());
    }

    async fn write_raw(io: &mut DuplexStream, env: Envelope) {
        write_envelope(io, &env).await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_command_during_bootstrap() {
        let (_alpha, beta) = trusted_pair().await;
        let (b_io, mut fake_alpha) = tokio::io::duplex(1024);
        let session = Session::new(
            Arc::clone(&beta.ctx),
            SessionRole::Outgoing,
            cert("alpha", "fp-alpha"),
        );
        write_raw(
            &mut fake_alpha,
            Envelope::new("alpha", "beta", CHALLENGE_GROUP, CMD_CHALLENGE_REQUEST, "x"),
        )
        .await;
        assert!(matches!(
            session.run(b_io).await,
            Err(WireError::UnexpectedCommand { .. })
        ));
        let record = beta.ctx.directory.get("alpha").unwrap().unwrap();
        assert!(record.shared_secret().is_none());
    }

    #[tokio::test]
    async fn test_second_challenge_request_is_a_violation() {
        let (_alpha, beta) = trusted_pair().await;
        beta.ctx
            .directory
            .update("alpha", |r| {
                r.pin("fp-alpha");
                r.set_shared_secret("c2VjcmV0");
                Ok(())
            })
            .await
            .unwrap();
        let (b_io, mut fake_alpha) = tokio::io::duplex(64 * 1024);
        let session = Session::new(
            Arc::clone(&beta.ctx),
            SessionRole::Outgoing,
            cert("alpha", "fp-alpha"),
        );
        for _ in 0..2 {
            write_raw(
                &mut fake_alpha,
                Envelope::new("alpha", "beta", CHALLENGE_GROUP, CMD_CHALLENGE_REQUEST, "n"),
            )
            .await;
        }
        assert!(matches!(
            session.run(b_io).await,
            Err(WireError::UnexpectedCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let beta = test_node(
            "beta",
            WireConfig {
                handshake_timeout: Duration::from_millis(100),
                ..test_config()
            },
        );
        beta.ctx
            .directory
            .set_endpoint("alpha", NodeRole::Client, "h", 1)
            .await
            .unwrap();
        let (b_io, _silent) = tokio::io::duplex(1024);
        let session = Session::new(
            Arc::clone(&beta.ctx),
            SessionRole::Outgoing,
            cert("alpha", "fp-alpha"),
        );
        assert!(matches!(
            session.run(b_io).await,
            Err(WireError::Timeout(_))
        ));
    }
}
