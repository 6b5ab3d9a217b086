//! Node and external client removal.
//!
//! Deletion is announced before the record disappears: the owning host is
//! told its node is going away, every other host gets a peer view with the
//! node as a removal entry, and DNS drops its name.  Each of those steps is
//! independent; a failure is logged and the rest still run.  Nodes routed
//! through a deleted gateway or failover peer are detached first.

use std::sync::Arc;

use log::{debug, error, info};

use crate::broadcast::{Broadcaster, FanoutSummary};
use crate::dispatch::Dispatcher;
use crate::dns::DnsService;
use crate::error::{Error, Result};
use crate::gateway::node_in_network;
use crate::registry::{modify_node, NodeLocks, Registry};
use crate::types::{ExtClient, Node, NodeAction, NodeId};

/// What an announcement managed to deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub owner_notified: bool,
    pub fanout: Option<FanoutSummary>,
    pub dns_refreshed: bool,
    pub failures: usize,
}

#[derive(Clone)]
pub struct DeletionCoordinator {
    registry: Arc<dyn Registry>,
    broadcaster: Arc<Broadcaster>,
    dns: Option<DnsService>,
    dispatcher: Dispatcher,
    locks: Arc<NodeLocks>,
}

impl DeletionCoordinator {
    /// `dns` is only set when DNS mode is on.
    pub fn new(
        registry: Arc<dyn Registry>,
        broadcaster: Arc<Broadcaster>,
        dns: Option<DnsService>,
        dispatcher: Dispatcher,
        locks: Arc<NodeLocks>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            dns,
            dispatcher,
            locks,
        }
    }

    pub async fn announce_deletion(
        &self,
        node: &Node,
        notify_owning_host: bool,
        related_clients: &[ExtClient],
    ) -> DeletionReport {
        let mut report = DeletionReport::default();
        let mut node = node.clone();
        node.pending_delete = true;
        node.action = NodeAction::Delete;

        if notify_owning_host {
            match self.broadcaster.node_update(&node).await {
                Ok(()) => report.owner_notified = true,
                Err(e) => {
                    report.failures += 1;
                    error!("failed to notify owner of deleted node {}: {}", node.id, e);
                }
            }
        }

        match self
            .broadcaster
            .publish_deleted_node_peer_update(&node, related_clients)
            .await
        {
            Ok(summary) => {
                report.failures += summary.failed;
                report.fanout = Some(summary);
            }
            Err(e) => {
                report.failures += 1;
                error!("failed to broadcast deletion of node {}: {}", node.id, e);
            }
        }

        if let Some(dns) = &self.dns {
            dns.refresh(&node.network).await;
            report.dns_refreshed = true;
        }
        debug!("deletion of {} announced: {:?}", node.id, report);
        report
    }

    /// Marks the node for deletion and queues its announcement and removal.
    pub async fn delete_node(&self, network: &str, node_id: NodeId) -> Result<Node> {
        let node = {
            let _guard = self.locks.lock(node_id).await;
            let mut node = node_in_network(self.registry.as_ref(), network, node_id).await?;
            node.pending_delete = true;
            node.action = NodeAction::Delete;
            self.registry.update_node(&node).await?
        };
        info!("node {} in network {} marked for deletion", node_id, network);

        let this = self.clone();
        let deleted = node.clone();
        self.dispatcher.submit("node deletion", async move {
            this.purge_node(&deleted).await;
        });
        Ok(node)
    }

    async fn purge_node(&self, deleted: &Node) {
        let related: Vec<ExtClient> = match self.registry.list_ext_clients(&deleted.network).await {
            Ok(clients) => clients
                .into_iter()
                .filter(|c| c.ingress_gateway_id == Some(deleted.id))
                .collect(),
            Err(e) => {
                error!("failed to list clients of deleted node {}: {}", deleted.id, e);
                Vec::new()
            }
        };
        self.detach_dependents(deleted).await;
        self.announce_deletion(deleted, true, &related).await;

        for client in &related {
            if let Err(e) = self
                .registry
                .remove_ext_client(&client.network, &client.client_id)
                .await
            {
                error!("failed to remove client {}: {}", client.client_id, e);
            }
        }
        match self.registry.remove_node(deleted.id).await {
            Ok(()) => {
                self.locks.forget(deleted.id);
                info!("node {} removed", deleted.id);
            }
            Err(e) => error!("failed to remove node {}: {}", deleted.id, e),
        }
        if !related.is_empty() {
            if let Some(dns) = &self.dns {
                dns.refresh(&deleted.network).await;
            }
        }
    }

    /// Clears every gateway and failover reference other nodes of the
    /// network hold to `deleted`.
    async fn detach_dependents(&self, deleted: &Node) {
        let nodes = match self.registry.list_nodes(Some(&deleted.network)).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("failed to list nodes depending on {}: {}", deleted.id, e);
                return;
            }
        };
        let gone = Some(deleted.id);
        for dependent in nodes.iter().filter(|n| {
            n.id != deleted.id && (n.internet_gw_node_id == gone || n.failed_over_by == gone)
        }) {
            let detached = modify_node(self.registry.as_ref(), dependent.id, |n| {
                if n.internet_gw_node_id == gone {
                    n.internet_gw_node_id = None;
                }
                if n.failed_over_by == gone {
                    n.failed_over_by = None;
                }
            })
            .await;
            match detached {
                Ok(_) => debug!("node {} detached from deleted node {}", dependent.id, deleted.id),
                Err(e) => error!("failed to detach node {} from {}: {}", dependent.id, deleted.id, e),
            }
        }
    }

    /// Queues the announcement and removal of an external client.
    pub async fn delete_ext_client(&self, network: &str, client_id: &str) -> Result<ExtClient> {
        let client = self
            .registry
            .get_ext_client(network, client_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::bad_request(e.to_string())
                } else {
                    Error::from(e)
                }
            })?;

        let this = self.clone();
        let deleted = client.clone();
        self.dispatcher.submit("client deletion", async move {
            this.purge_ext_client(&deleted).await;
        });
        Ok(client)
    }

    async fn purge_ext_client(&self, deleted: &ExtClient) {
        if let Err(e) = self
            .broadcaster
            .publish_deleted_client_peer_update(deleted)
            .await
        {
            error!("failed to announce removal of client {}: {}", deleted.client_id, e);
        }
        match self
            .registry
            .remove_ext_client(&deleted.network, &deleted.client_id)
            .await
        {
            Ok(()) => info!("client {} removed from {}", deleted.client_id, deleted.network),
            Err(e) => error!("failed to remove client {}: {}", deleted.client_id, e),
        }
        if let Some(dns) = &self.dns {
            dns.refresh(&deleted.network).await;
        }
    }
}
