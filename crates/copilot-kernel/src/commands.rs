//! One-shot node administration.
//!
//! Each command opens the node directory, applies one change, and returns.
//! Nothing here touches the network; a running daemon picks the change up
//! on its next directory read.

use crate::error::{KernelError, KernelResult};
use copilot_directory::{DirectoryError, JsonFileStore, NodeDirectory};
use copilot_types::config::CopilotConfig;
use copilot_types::{NodeRecord, NodeRole};
use copilot_wire::TlsIdentity;
use std::sync::Arc;

/// The directory of `config`, backed by `<data_dir>/core.json`.
pub fn open_directory(config: &CopilotConfig) -> NodeDirectory {
    NodeDirectory::new(Arc::new(JsonFileStore::new(config.nodes_path())))
}

/// Split `host:port`. IPv6 hosts may be bracketed (`[::1]:4444`).
pub fn parse_address(addr: &str) -> KernelResult<(String, u16)> {
    let invalid = |reason: &str| KernelError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| invalid("port must be a number between 0 and 65535"))?;
    Ok((host.to_string(), port))
}

/// Make this node a TLS server on `addr`.
pub async fn serve(directory: &NodeDirectory, node_name: &str, addr: &str) -> KernelResult<NodeRecord> {
    let (host, port) = parse_address(addr)?;
    Ok(directory
        .set_endpoint(node_name, NodeRole::Server, &host, port)
        .await?)
}

/// Allow `name` to connect to us.
pub async fn allow_incoming(directory: &NodeDirectory, name: &str) -> KernelResult<NodeRecord> {
    Ok(directory
        .set_endpoint(name, NodeRole::IncomingPeer, "", 0)
        .await?)
}

/// Dial `name` at `addr` whenever the daemon runs.
pub async fn connect_to(directory: &NodeDirectory, name: &str, addr: &str) -> KernelResult<NodeRecord> {
    let (host, port) = parse_address(addr)?;
    Ok(directory
        .set_endpoint(name, NodeRole::Client, &host, port)
        .await?)
}

/// Accept the fingerprint `name` presented. Returns it.
pub async fn accept(directory: &NodeDirectory, name: &str) -> KernelResult<String> {
    Ok(directory.accept_pending(name).await?)
}

/// Forget every key and secret of `name`.
pub async fn reject(directory: &NodeDirectory, name: &str) -> KernelResult<()> {
    Ok(directory.forget(name).await?)
}

/// Remove the record of `name`.
pub async fn delete(directory: &NodeDirectory, name: &str) -> KernelResult<()> {
    if directory.delete(name).await? {
        Ok(())
    } else {
        Err(DirectoryError::NotFound(name.to_string()).into())
    }
}

/// Every record, ordered by name.
pub fn list(directory: &NodeDirectory) -> KernelResult<Vec<NodeRecord>> {
    Ok(directory.list()?)
}

/// This node's TLS identity, generated on first use.
pub fn identity(config: &CopilotConfig) -> KernelResult<TlsIdentity> {
    std::fs::create_dir_all(&config.data_dir)?;
    Ok(TlsIdentity::load_or_generate(
        &config.data_dir,
        &config.node_name,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(dir: &tempfile::TempDir) -> CopilotConfig {
        CopilotConfig {
            node_name: "alpha".to_string(),
            data_dir: PathBuf::from(dir.path()),
            ..CopilotConfig::default()
        }
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("example.org:4444").unwrap(),
            ("example.org".to_string(), 4444)
        );
        assert_eq!(parse_address("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(parse_address("example.org").is_err());
        assert!(parse_address(":4444").is_err());
        assert!(parse_address("host:99999").is_err());
        assert!(parse_address("host:http").is_err());
    }

    #[tokio::test]
    async fn test_commands_write_core_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let directory = open_directory(&config);

        serve(&directory, "alpha", "0.0.0.0:4444").await.unwrap();
        allow_incoming(&directory, "beta").await.unwrap();
        connect_to(&directory, "gamma", "10.1.1.1:5555").await.unwrap();

        let names: Vec<String> = list(&directory)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);

        // A second handle on the same file sees the same records.
        let reopened = open_directory(&config);
        let gamma = reopened.get("gamma").unwrap().unwrap();
        assert_eq!(gamma.role, NodeRole::Client);
        assert_eq!(gamma.address(), "10.1.1.1:5555");
        assert_eq!(
            reopened.get("alpha").unwrap().unwrap().role,
            NodeRole::Server
        );
    }

    #[tokio::test]
    async fn test_accept_reject_delete() {
        let dir = tempfile::tempdir().unwrap();
        let directory = open_directory(&config(&dir));
        allow_incoming(&directory, "beta").await.unwrap();

        let err = accept(&directory, "beta").await.unwrap_err();
        assert_eq!(err.to_string(), "No key requested");

        directory.check_incoming("beta", "fp", false).await.unwrap();
        assert_eq!(accept(&directory, "beta").await.unwrap(), "fp");
        reject(&directory, "beta").await.unwrap();
        assert!(!directory.get("beta").unwrap().unwrap().is_accepted());

        delete(&directory, "beta").await.unwrap();
        assert!(matches!(
            delete(&directory, "beta").await,
            Err(KernelError::Directory(DirectoryError::NotFound(_)))
        ));
        assert!(reject(&directory, "beta").await.is_err());
    }

    #[test]
    fn test_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let first = identity(&config).unwrap();
        let second = identity(&config).unwrap();
        assert_eq!(first.node_name(), "alpha");
        assert_eq!(first.fingerprint(), second.fingerprint());
    }
}
