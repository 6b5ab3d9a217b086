//! Registry boundary.
//!
//! The control plane never owns hosts or nodes; it reads and writes them
//! through [`Registry`].  [`MemoryRegistry`] keeps everything in process and
//! can be seeded from a JSON snapshot.  Node writes are versioned: an update
//! only lands if the caller saw the latest version, and [`NodeLocks`]
//! serializes the gateway and deletion paths per node on top of that.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::error::RegistryError;
use crate::types::{CustomDns, ExtClient, Host, HostId, Node, NodeId};

/// Attempts made by [`modify_node`] before a version conflict is returned.
const MODIFY_ATTEMPTS: usize = 3;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<Host>, RegistryError>;

    async fn get_host(&self, id: HostId) -> Result<Host, RegistryError>;

    /// All nodes, or only those of `network` when given.
    async fn list_nodes(&self, network: Option<&str>) -> Result<Vec<Node>, RegistryError>;

    async fn get_node(&self, id: NodeId) -> Result<Node, RegistryError>;

    /// Stores `node` if its `version` matches the stored one and returns the
    /// stored copy with the version bumped.
    async fn update_node(&self, node: &Node) -> Result<Node, RegistryError>;

    async fn remove_node(&self, id: NodeId) -> Result<(), RegistryError>;

    async fn list_ext_clients(&self, network: &str) -> Result<Vec<ExtClient>, RegistryError>;

    async fn get_ext_client(
        &self,
        network: &str,
        client_id: &str,
    ) -> Result<ExtClient, RegistryError>;

    async fn remove_ext_client(&self, network: &str, client_id: &str)
        -> Result<(), RegistryError>;

    async fn list_custom_dns(&self, network: &str) -> Result<Vec<CustomDns>, RegistryError>;
}

/// Re-reads node `id`, applies `change` and writes it back, retrying when a
/// concurrent writer bumped the version in between.
pub async fn modify_node<F>(
    registry: &dyn Registry,
    id: NodeId,
    change: F,
) -> Result<Node, RegistryError>
where
    F: Fn(&mut Node) + Send + Sync,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut node = registry.get_node(id).await?;
        change(&mut node);
        match registry.update_node(&node).await {
            Err(RegistryError::VersionConflict { .. }) if attempt < MODIFY_ATTEMPTS => {
                debug!("version conflict on node {}, retrying ({})", id, attempt);
            }
            result => return result,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    ext_clients: Vec<ExtClient>,
    #[serde(default)]
    custom_dns: Vec<CustomDns>,
}

#[derive(Debug, Default)]
struct Tables {
    hosts: BTreeMap<HostId, Host>,
    nodes: BTreeMap<NodeId, Node>,
    ext_clients: Vec<ExtClient>,
    custom_dns: Vec<CustomDns>,
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tables: RwLock<Tables>,
}

impl MemoryRegistry {
    pub fn from_snapshot_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read registry snapshot {}: {}", path.display(), e))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        let mut tables = Tables {
            hosts: snapshot.hosts.into_iter().map(|h| (h.id, h)).collect(),
            nodes: snapshot.nodes.into_iter().map(|n| (n.id, n)).collect(),
            ext_clients: snapshot.ext_clients,
            custom_dns: snapshot.custom_dns,
        };
        for node in tables.nodes.values_mut() {
            if !tables.hosts.contains_key(&node.host_id) {
                warn!("Node {} references unknown host {}", node.id, node.host_id);
            }
            node.version = node.version.max(1);
        }
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    pub async fn insert_host(&self, host: Host) {
        self.tables.write().await.hosts.insert(host.id, host);
    }

    /// Inserts or replaces a node and returns the stored copy.
    pub async fn insert_node(&self, mut node: Node) -> Node {
        let mut tables = self.tables.write().await;
        let previous = tables.nodes.get(&node.id).map_or(0, |n| n.version);
        node.version = previous + 1;
        tables.nodes.insert(node.id, node.clone());
        node
    }

    pub async fn insert_ext_client(&self, client: ExtClient) {
        let mut tables = self.tables.write().await;
        tables
            .ext_clients
            .retain(|c| !(c.network == client.network && c.client_id == client.client_id));
        tables.ext_clients.push(client);
    }

    pub async fn insert_custom_dns(&self, entry: CustomDns) {
        self.tables.write().await.custom_dns.push(entry);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_hosts(&self) -> Result<Vec<Host>, RegistryError> {
        Ok(self.tables.read().await.hosts.values().cloned().collect())
    }

    async fn get_host(&self, id: HostId) -> Result<Host, RegistryError> {
        self.tables
            .read()
            .await
            .hosts
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("host", id))
    }

    async fn list_nodes(&self, network: Option<&str>) -> Result<Vec<Node>, RegistryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .nodes
            .values()
            .filter(|n| network.map_or(true, |net| n.network == net))
            .cloned()
            .collect())
    }

    async fn get_node(&self, id: NodeId) -> Result<Node, RegistryError> {
        self.tables
            .read()
            .await
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("node", id))
    }

    async fn update_node(&self, node: &Node) -> Result<Node, RegistryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| RegistryError::not_found("node", node.id))?;
        if stored.version != node.version {
            return Err(RegistryError::VersionConflict {
                id: node.id,
                expected: node.version,
                actual: stored.version,
            });
        }
        *stored = node.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn remove_node(&self, id: NodeId) -> Result<(), RegistryError> {
        self.tables
            .write()
            .await
            .nodes
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::not_found("node", id))
    }

    async fn list_ext_clients(&self, network: &str) -> Result<Vec<ExtClient>, RegistryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .ext_clients
            .iter()
            .filter(|c| c.network == network)
            .cloned()
            .collect())
    }

    async fn get_ext_client(
        &self,
        network: &str,
        client_id: &str,
    ) -> Result<ExtClient, RegistryError> {
        let tables = self.tables.read().await;
        tables
            .ext_clients
            .iter()
            .find(|c| c.network == network && c.client_id == client_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("ext client", client_id))
    }

    async fn remove_ext_client(
        &self,
        network: &str,
        client_id: &str,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;
        let before = tables.ext_clients.len();
        tables
            .ext_clients
            .retain(|c| !(c.network == network && c.client_id == client_id));
        if tables.ext_clients.len() == before {
            return Err(RegistryError::not_found("ext client", client_id));
        }
        Ok(())
    }

    async fn list_custom_dns(&self, network: &str) -> Result<Vec<CustomDns>, RegistryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .custom_dns
            .iter()
            .filter(|c| c.network == network)
            .cloned()
            .collect())
    }
}

/// Per-node mutual exclusion for read-modify-write sequences.
#[derive(Debug, Default)]
pub struct NodeLocks {
    locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeLocks {
    pub async fn lock(&self, id: NodeId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry of a node that no longer exists.
    pub fn forget(&self, id: NodeId) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}
