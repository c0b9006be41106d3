//! Per-node serialized access to the node store.
//!
//! Every read-modify-write of a record runs under that node's lock and as a
//! single [`NodeStore::modify`] step, so an operator accepting or rejecting a
//! peer, from this process or another one, can never interleave with a
//! session that is pinning a certificate or saving a secret for the same
//! node.

use crate::error::{DirectoryError, DirectoryResult};
use crate::store::NodeStore;
use copilot_types::{NodeRecord, NodeRole};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Outcome of checking a presented certificate fingerprint against a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertCheck {
    /// The fingerprint is pinned for this node. Carries the shared secret
    /// when one has already been bootstrapped.
    Trusted { shared_secret: Option<String> },
    /// The fingerprint was stored as pending; an operator must accept it.
    PendingApproval,
    /// A different fingerprint is pinned.
    Mismatch,
    /// No record exists for the node and unknown peers are not allowed.
    UnknownNode,
}

/// Durable peer records behind per-node locks.
pub struct NodeDirectory {
    store: Arc<dyn NodeStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for NodeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDirectory")
            .field("locked_nodes", &self.locks.len())
            .finish()
    }
}

impl NodeDirectory {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Current state of one record.
    pub fn get(&self, name: &str) -> DirectoryResult<Option<NodeRecord>> {
        self.store.get(name)
    }

    /// Every readable record, ordered by name.
    pub fn list(&self) -> DirectoryResult<Vec<NodeRecord>> {
        self.store.list()
    }

    /// Run `decide` on the current record as one store step under the node
    /// lock. `decide` returns the record to save, if any, and a result.
    async fn modify<T, F>(&self, name: &str, decide: F) -> DirectoryResult<T>
    where
        F: FnOnce(Option<NodeRecord>) -> DirectoryResult<(Option<NodeRecord>, T)>,
    {
        let _guard = self.lock(name).await;
        let mut out = None;
        self.store.modify(
            name,
            Box::new(|current: Option<NodeRecord>| {
                let (next, value) = decide(current)?;
                out = Some(value);
                Ok(next)
            }),
        )?;
        // A store only skips `decide` when reading failed, which is returned above.
        out.ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    /// Apply `f` to an existing record and save it when `f` succeeds.
    pub async fn update<T, F>(&self, name: &str, f: F) -> DirectoryResult<T>
    where
        F: FnOnce(&mut NodeRecord) -> DirectoryResult<T>,
    {
        self.modify(name, |current| {
            let mut record = current.ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
            let out = f(&mut record)?;
            Ok((Some(record), out))
        })
        .await
    }

    /// Create the record if needed, then apply `f` and save.
    pub async fn upsert<T, F>(&self, name: &str, f: F) -> DirectoryResult<T>
    where
        F: FnOnce(&mut NodeRecord) -> DirectoryResult<T>,
    {
        self.modify(name, |current| {
            let mut record =
                current.unwrap_or_else(|| NodeRecord::new(name, NodeRole::Undefined, "", 0));
            let out = f(&mut record)?;
            Ok((Some(record), out))
        })
        .await
    }

    /// Set a node's role and address, creating the record if needed.
    /// Trust material is left as it is.
    pub async fn set_endpoint(
        &self,
        name: &str,
        role: NodeRole,
        host: &str,
        port: u16,
    ) -> DirectoryResult<NodeRecord> {
        let record = self
            .upsert(name, |record| {
                record.role = role;
                record.host = host.to_string();
                record.port = port;
                Ok(record.clone())
            })
            .await?;
        info!(node = %name, role = %role, addr = %record.address(), "Node endpoint set");
        Ok(record)
    }

    /// Make sure a record exists; existing records are returned untouched.
    pub async fn ensure_node(&self, name: &str, role: NodeRole) -> DirectoryResult<NodeRecord> {
        let (record, created) = self
            .modify(name, |current| match current {
                Some(record) => Ok((None, (record, false))),
                None => {
                    let record = NodeRecord::new(name, role, "", 0);
                    Ok((Some(record.clone()), (record, true)))
                }
            })
            .await?;
        if created {
            debug!(node = %name, role = %role, "Node record created");
        }
        Ok(record)
    }

    /// Promote the pending fingerprint of `name` to pinned.
    pub async fn accept_pending(&self, name: &str) -> DirectoryResult<String> {
        let fingerprint = self
            .update(name, |record| Ok(record.accept_pending()?))
            .await?;
        info!(node = %name, fingerprint = %fingerprint, "Peer certificate accepted");
        Ok(fingerprint)
    }

    /// Forget pinned and pending fingerprints and the shared secret of `name`.
    pub async fn forget(&self, name: &str) -> DirectoryResult<()> {
        self.update(name, |record| {
            record.forget();
            Ok(())
        })
        .await?;
        info!(node = %name, "Peer trust cleared");
        Ok(())
    }

    /// Remove the record of `name`. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> DirectoryResult<bool> {
        let removed = {
            let _guard = self.lock(name).await;
            self.store.delete(name)?
        };
        self.locks.remove(name);
        if removed {
            info!(node = %name, "Node record deleted");
        }
        Ok(removed)
    }

    /// Check a certificate presented by a node that connected to us.
    ///
    /// A node with no pinned fingerprint gets the presented one stored as
    /// pending. Unknown nodes get an IncomingPeer record only when
    /// `allow_unknown` is set.
    pub async fn check_incoming(
        &self,
        name: &str,
        fingerprint: &str,
        allow_unknown: bool,
    ) -> DirectoryResult<CertCheck> {
        self.modify(name, |current| {
            let mut record = match current {
                Some(record) => record,
                None if allow_unknown => NodeRecord::new(name, NodeRole::IncomingPeer, "", 0),
                None => {
                    warn!(peer = %name, "Connection from unknown node refused");
                    return Ok((None, CertCheck::UnknownNode));
                }
            };

            match record.pinned_fingerprint() {
                Some(pinned) if pinned == fingerprint => {
                    let shared_secret = record.shared_secret().map(str::to_string);
                    Ok((None, CertCheck::Trusted { shared_secret }))
                }
                Some(_) => {
                    warn!(peer = %name, "Presented certificate does not match the pinned one");
                    Ok((None, CertCheck::Mismatch))
                }
                None => {
                    record.request_trust(fingerprint)?;
                    info!(peer = %name, fingerprint = %fingerprint, "Certificate awaiting approval");
                    Ok((Some(record), CertCheck::PendingApproval))
                }
            }
        })
        .await
    }

    /// Check a certificate presented by a node we dialed.
    ///
    /// First contact pins the fingerprint directly.
    pub async fn check_outgoing(&self, name: &str, fingerprint: &str) -> DirectoryResult<CertCheck> {
        self.modify(name, |current| {
            let Some(mut record) = current else {
                return Ok((None, CertCheck::UnknownNode));
            };

            match record.pinned_fingerprint() {
                Some(pinned) if pinned == fingerprint => {
                    let shared_secret = record.shared_secret().map(str::to_string);
                    Ok((None, CertCheck::Trusted { shared_secret }))
                }
                Some(_) => {
                    warn!(peer = %name, "Presented certificate does not match the pinned one");
                    Ok((None, CertCheck::Mismatch))
                }
                None => {
                    record.pin(fingerprint);
                    info!(peer = %name, fingerprint = %fingerprint, "Certificate pinned on first contact");
                    Ok((Some(record), CertCheck::Trusted { shared_secret: None }))
                }
            }
        })
        .await
    }

    /// Store `secret` for `name`, but only while `fingerprint` is still the
    /// pinned one. Returns whether the secret was saved.
    pub async fn store_secret(
        &self,
        name: &str,
        fingerprint: &str,
        secret: &str,
    ) -> DirectoryResult<bool> {
        self.modify(name, |current| {
            let Some(mut record) = current else {
                return Ok((None, false));
            };
            if record.pinned_fingerprint() != Some(fingerprint) {
                warn!(peer = %name, "Trust changed during secret exchange; secret discarded");
                return Ok((None, false));
            }
            record.set_shared_secret(secret);
            debug!(peer = %name, "Shared secret stored");
            Ok((Some(record), true))
        })
        .await
    }
}
