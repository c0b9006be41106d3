//! Node records — the durable description of a known peer.
//!
//! A record stores how to reach a node and what we know about its identity:
//! the pinned certificate fingerprint, a fingerprint waiting for operator
//! approval, and the shared secret used for challenge-response. The two
//! fingerprint slots are mutually exclusive; the only way to change them is
//! through the mutator methods, which keep that invariant.

use crate::error::TrustError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Host used when a record does not specify one.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port used when a record does not specify one.
pub const DEFAULT_PORT: u16 = 4444;

/// What this node does with a configured peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum NodeRole {
    /// Known, but nothing is done with it.
    #[default]
    Undefined,
    /// We serve TLS connections on this record's address.
    Server,
    /// We connect out to this record's address.
    Client,
    /// The node connects to us.
    IncomingPeer,
}

impl From<i64> for NodeRole {
    fn from(value: i64) -> Self {
        match value {
            1 => Self::Server,
            2 => Self::Client,
            3 => Self::IncomingPeer,
            _ => Self::Undefined,
        }
    }
}

impl From<NodeRole> for i64 {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Undefined => 0,
            NodeRole::Server => 1,
            NodeRole::Client => 2,
            NodeRole::IncomingPeer => 3,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
            Self::IncomingPeer => write!(f, "incoming"),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Older documents store cleared fields as empty strings.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()))
}

/// The persisted description of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node name (the key of the record in the directory; not serialized).
    #[serde(skip)]
    pub name: String,
    /// What we do with this node.
    #[serde(rename = "type", default)]
    pub role: NodeRole,
    /// Host to listen on (server) or dial (client).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on (server) or dial (client).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(
        rename = "peerCertSignature",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pinned_fingerprint: Option<String>,
    #[serde(
        rename = "peerCertSignatureReq",
        alias = "peerCertReqSignature",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pending_fingerprint: Option<String>,
    #[serde(
        rename = "sharedSecret",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    shared_secret: Option<String>,
    /// Fields written by other components; kept so saves do not drop them.
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeRecord {
    /// Create a record with no trust material.
    pub fn new(name: impl Into<String>, role: NodeRole, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            role,
            host: host.into(),
            port,
            pinned_fingerprint: None,
            pending_fingerprint: None,
            shared_secret: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Host with the default substituted for an empty value.
    pub fn effective_host(&self) -> &str {
        if self.host.is_empty() {
            DEFAULT_HOST
        } else {
            &self.host
        }
    }

    /// Port with the default substituted for zero.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }

    /// `host:port` with defaults applied.
    pub fn address(&self) -> String {
        format!("{}:{}", self.effective_host(), self.effective_port())
    }

    /// The accepted certificate fingerprint, if any.
    pub fn pinned_fingerprint(&self) -> Option<&str> {
        self.pinned_fingerprint.as_deref()
    }

    /// The fingerprint awaiting operator approval, if any.
    pub fn pending_fingerprint(&self) -> Option<&str> {
        self.pending_fingerprint.as_deref()
    }

    /// The shared secret, if bootstrapped.
    pub fn shared_secret(&self) -> Option<&str> {
        self.shared_secret.as_deref()
    }

    /// Whether a fingerprint is waiting for approval.
    pub fn is_requested(&self) -> bool {
        self.pending_fingerprint.is_some()
    }

    /// Whether a fingerprint has been accepted.
    pub fn is_accepted(&self) -> bool {
        self.pinned_fingerprint.is_some()
    }

    /// Pin `fingerprint` directly (trust on first use). Clears any pending request.
    pub fn pin(&mut self, fingerprint: impl Into<String>) {
        self.pinned_fingerprint = Some(fingerprint.into());
        self.pending_fingerprint = None;
    }

    /// Record `fingerprint` as waiting for approval.
    ///
    /// Refused when a fingerprint is already pinned. A newer request
    /// replaces an older pending one.
    pub fn request_trust(&mut self, fingerprint: impl Into<String>) -> Result<(), TrustError> {
        if self.pinned_fingerprint.is_some() {
            return Err(TrustError::AlreadyTrusted);
        }
        self.pending_fingerprint = Some(fingerprint.into());
        Ok(())
    }

    /// Promote the pending fingerprint to pinned. Returns the accepted value.
    pub fn accept_pending(&mut self) -> Result<String, TrustError> {
        if self.pinned_fingerprint.is_some() {
            return Err(TrustError::AlreadyTrusted);
        }
        let fingerprint = self
            .pending_fingerprint
            .take()
            .ok_or(TrustError::NothingPending)?;
        self.pinned_fingerprint = Some(fingerprint.clone());
        Ok(fingerprint)
    }

    /// Forget every piece of trust material for this node.
    pub fn forget(&mut self) {
        self.pinned_fingerprint = None;
        self.pending_fingerprint = None;
        self.shared_secret = None;
    }

    /// Store the shared secret.
    pub fn set_shared_secret(&mut self, secret: impl Into<String>) {
        self.shared_secret = Some(secret.into());
    }
}
