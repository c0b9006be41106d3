//! Peer registry — live view of established sessions.
//!
//! Entries are added when a session reaches Established and removed when it
//! closes. Several sessions to the same node (one incoming, one outgoing)
//! are tracked separately by their session label.

use crate::session::SessionRole;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// One established session.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Node name of the remote side (certificate CN).
    pub node_name: String,
    /// Which side opened the connection.
    pub role: SessionRole,
    /// Socket address of the remote side, when known.
    pub remote_addr: Option<SocketAddr>,
    /// Unique label of the session, used in logs.
    pub session: String,
    /// When the session was established.
    pub connected_at: DateTime<Utc>,
}

/// Thread-safe registry of established sessions.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    sessions: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an established session.
    pub fn add(&self, entry: PeerEntry) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(entry.session.clone(), entry);
    }

    /// Forget a session.
    pub fn remove(&self, session: &str) -> Option<PeerEntry> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session)
    }

    /// Whether any session to `node_name` is established.
    pub fn is_connected(&self, node_name: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().any(|e| e.node_name == node_name)
    }

    /// Every established session, ordered by node name then session label.
    pub fn all(&self) -> Vec<PeerEntry> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<PeerEntry> = sessions.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.node_name
                .cmp(&b.node_name)
                .then_with(|| a.session.cmp(&b.session))
        });
        entries
    }

    /// Number of established sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
