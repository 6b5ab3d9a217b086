//! Internet gateway state transitions.
//!
//! A node moves between "not a gateway" and "internet gateway"; the ingress
//! flag is orthogonal.  Every transition on a node holds that node's lock
//! for the whole read-modify-write, persists, and then queues a full peer
//! broadcast without waiting for it.
//!
//! The gateway node is stored first; clients and the network's failover
//! peer are only rewritten once it is.  A gateway and a failover peer both
//! claim the network's external routes, so promotion clears the failover
//! peer.

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::registry::{modify_node, NodeLocks, Registry};
use crate::types::{Firewall, InetNodeReq, Node, NodeId, OsClass};

pub const DEFAULT_INGRESS_DNS: &str = "1.1.1.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The node already was a gateway; nothing changed.
    AlreadyGateway(Node),
    Promoted(Node),
}

/// Semantic checks on a gateway request.  Failures are bad requests.
#[async_trait]
pub trait GatewayValidator: Send + Sync {
    async fn validate(&self, gateway: &Node, req: &InetNodeReq, update: bool) -> Result<()>;
}

pub struct EgressValidator {
    registry: Arc<dyn Registry>,
}

impl EgressValidator {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl GatewayValidator for EgressValidator {
    async fn validate(&self, gateway: &Node, req: &InetNodeReq, update: bool) -> Result<()> {
        let host = self.registry.get_host(gateway.host_id).await?;
        if host.firewall_in_use == Firewall::None {
            return Err(Error::bad_request(
                "iptables or nftables needs to be installed",
            ));
        }
        if gateway.internet_gw_node_id.is_some() {
            return Err(Error::bad_request(format!(
                "node {} is using an internet gateway already",
                gateway.id
            )));
        }
        if gateway.is_relayed {
            return Err(Error::bad_request(format!(
                "node {} is being relayed",
                gateway.id
            )));
        }

        for client_id in &req.inet_node_client_ids {
            let client = self
                .registry
                .get_node(*client_id)
                .await
                .map_err(|e| Error::bad_request(e.to_string()))?;
            if client.id == gateway.id {
                return Err(Error::bad_request("a gateway cannot be its own client"));
            }
            if client.network != gateway.network {
                return Err(Error::bad_request(format!(
                    "node {} is not in network {}",
                    client.id, gateway.network
                )));
            }
            if client.is_fail_over {
                return Err(Error::bad_request(
                    "failover node cannot be set to use internet gateway",
                ));
            }
            let client_host = self
                .registry
                .get_host(client.host_id)
                .await
                .map_err(|e| Error::bad_request(e.to_string()))?;
            if client_host.is_default {
                return Err(Error::bad_request(
                    "default host cannot be set to use internet gateway",
                ));
            }
            if !matches!(client_host.os, OsClass::Linux | OsClass::Windows) {
                return Err(Error::bad_request(
                    "can only attach linux or windows machine to an internet gateway",
                ));
            }
            if client.is_internet_gateway {
                return Err(Error::bad_request(format!(
                    "node {} acting as internet gateway cannot use another internet gateway",
                    client.id
                )));
            }
            let attached_elsewhere = match client.internet_gw_node_id {
                Some(current) => !update || current != gateway.id,
                None => false,
            };
            if attached_elsewhere {
                return Err(Error::bad_request(format!(
                    "node {} is already using an internet gateway",
                    client.id
                )));
            }
            if client.is_relayed {
                return Err(Error::bad_request(format!(
                    "node {} is being relayed",
                    client.id
                )));
            }
            let siblings = self.registry.list_nodes(None).await?;
            if let Some(sibling) = siblings
                .iter()
                .find(|n| n.host_id == client.host_id && n.is_internet_gateway)
            {
                return Err(Error::bad_request(format!(
                    "node {} acting as internet gateway cannot use another internet gateway",
                    sibling.id
                )));
            }
        }
        Ok(())
    }
}

pub struct GatewayManager {
    registry: Arc<dyn Registry>,
    validator: Arc<dyn GatewayValidator>,
    broadcaster: Arc<Broadcaster>,
    dispatcher: Dispatcher,
    locks: Arc<NodeLocks>,
    failover_enabled: bool,
    default_ingress_dns: String,
}

impl GatewayManager {
    pub fn new(
        registry: Arc<dyn Registry>,
        validator: Arc<dyn GatewayValidator>,
        broadcaster: Arc<Broadcaster>,
        dispatcher: Dispatcher,
        locks: Arc<NodeLocks>,
    ) -> Self {
        Self {
            registry,
            validator,
            broadcaster,
            dispatcher,
            locks,
            failover_enabled: true,
            default_ingress_dns: DEFAULT_INGRESS_DNS.to_string(),
        }
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover_enabled = enabled;
        self
    }

    pub fn with_default_ingress_dns(mut self, dns: impl Into<String>) -> Self {
        self.default_ingress_dns = dns.into();
        self
    }

    /// Looks up a node addressed by network and id.  Unknown nodes are the
    /// caller's mistake.
    pub async fn node(&self, network: &str, node_id: NodeId) -> Result<Node> {
        node_in_network(self.registry.as_ref(), network, node_id).await
    }

    pub async fn promote(
        &self,
        network: &str,
        node_id: NodeId,
        req: InetNodeReq,
    ) -> Result<PromoteOutcome> {
        let _guard = self.locks.lock(node_id).await;
        let mut node = self.node(network, node_id).await?;
        if node.is_internet_gateway {
            info!("node {} is already acting as internet gateway", node_id);
            return Ok(PromoteOutcome::AlreadyGateway(node));
        }
        reject_pending_delete(&node)?;

        let host = self.registry.get_host(node.host_id).await?;
        if host.os != OsClass::Linux {
            return Err(Error::bad_request(
                "only linux nodes can be made internet gateways",
            ));
        }
        self.validator.validate(&node, &req, false).await?;

        let failover = if self.failover_enabled {
            self.failover_peer(&node).await?
        } else {
            None
        };
        if failover.is_some() {
            node.is_fail_over = false;
            node.fail_over_peers.clear();
            node.failed_over_by = None;
        }
        node.is_internet_gateway = true;
        node.inet_node_req = req;
        if node.is_ingress_gateway && node.ingress_dns.is_empty() {
            node.ingress_dns = self.default_ingress_dns.clone();
        }
        let node = self.registry.update_node(&node).await?;

        if let Some(failover_id) = failover {
            self.release_failover(&node, failover_id).await;
        }
        self.attach_clients(&node).await;

        info!("created internet gateway on node {} in network {}", node_id, network);
        self.announce();
        Ok(PromoteOutcome::Promoted(node))
    }

    /// Replaces the parameters of an existing gateway.
    pub async fn update(&self, network: &str, node_id: NodeId, req: InetNodeReq) -> Result<Node> {
        let _guard = self.locks.lock(node_id).await;
        let mut node = self.node(network, node_id).await?;
        if !node.is_internet_gateway {
            return Err(Error::bad_request("node is not an internet gateway"));
        }
        reject_pending_delete(&node)?;
        self.validator.validate(&node, &req, true).await?;

        node.inet_node_req = req;
        let node = self.registry.update_node(&node).await?;
        detach_clients(
            self.registry.as_ref(),
            &node.network,
            node.id,
            &node.inet_node_req.inet_node_client_ids,
        )
        .await;
        self.attach_clients(&node).await;

        info!("updated internet gateway on node {} in network {}", node_id, network);
        self.announce();
        Ok(node)
    }

    /// Clears the gateway role whether or not the node holds it.
    pub async fn demote(&self, network: &str, node_id: NodeId) -> Result<Node> {
        let _guard = self.locks.lock(node_id).await;
        let mut node = self.node(network, node_id).await?;

        node.is_internet_gateway = false;
        node.inet_node_req = InetNodeReq::default();
        let node = self.registry.update_node(&node).await?;
        detach_clients(self.registry.as_ref(), &node.network, node.id, &[]).await;

        info!("removed internet gateway on node {} in network {}", node_id, network);
        self.announce();
        Ok(node)
    }

    /// Points every requested client of a stored gateway at it.
    async fn attach_clients(&self, gateway: &Node) {
        for client_id in &gateway.inet_node_req.inet_node_client_ids {
            let attached = modify_node(self.registry.as_ref(), *client_id, |client| {
                client.internet_gw_node_id = Some(gateway.id);
                client.failed_over_by = None;
            })
            .await;
            if let Err(e) = attached {
                error!("failed to attach node {} to gateway {}: {}", client_id, gateway.id, e);
            }
        }
    }

    /// The failover peer of `node`'s network, if there is one.
    async fn failover_peer(&self, node: &Node) -> Result<Option<NodeId>> {
        let nodes = self.registry.list_nodes(Some(&node.network)).await?;
        let Some(failover) = nodes.iter().find(|n| n.is_fail_over) else {
            return Ok(None);
        };
        warn!(
            "promoting {} to internet gateway supersedes failover peer {} in {}",
            node.id, failover.id, node.network
        );
        Ok(Some(failover.id))
    }

    /// Clears the failover role and every reference to it, except on the
    /// gateway itself, which was stored without them.
    async fn release_failover(&self, gateway: &Node, failover_id: NodeId) {
        if failover_id != gateway.id {
            let cleared = modify_node(self.registry.as_ref(), failover_id, |n| {
                n.is_fail_over = false;
                n.fail_over_peers.clear();
            })
            .await;
            if let Err(e) = cleared {
                error!("failed to clear failover peer {}: {}", failover_id, e);
            }
        }
        let nodes = match self.registry.list_nodes(Some(&gateway.network)).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("failed to list nodes failed over by {}: {}", failover_id, e);
                return;
            }
        };
        for relayed in nodes
            .iter()
            .filter(|n| n.id != gateway.id && n.failed_over_by == Some(failover_id))
        {
            let cleared = modify_node(self.registry.as_ref(), relayed.id, |n| {
                if n.failed_over_by == Some(failover_id) {
                    n.failed_over_by = None;
                }
            })
            .await;
            if let Err(e) = cleared {
                error!("failed to clear failover of node {}: {}", relayed.id, e);
            }
        }
    }

    fn announce(&self) {
        let broadcaster = Arc::clone(&self.broadcaster);
        self.dispatcher.submit("peer update", async move {
            if let Err(e) = broadcaster.publish_peer_update().await {
                error!("peer update after gateway change failed: {}", e);
            }
        });
    }
}

/// Detaches every node of `network` routed through `gateway_id`, except the
/// ones listed in `keep`.  Failures are logged.
async fn detach_clients(
    registry: &dyn Registry,
    network: &str,
    gateway_id: NodeId,
    keep: &[NodeId],
) {
    let nodes = match registry.list_nodes(Some(network)).await {
        Ok(nodes) => nodes,
        Err(e) => {
            error!("failed to list clients of gateway {}: {}", gateway_id, e);
            return;
        }
    };
    for client in nodes
        .iter()
        .filter(|n| n.internet_gw_node_id == Some(gateway_id) && !keep.contains(&n.id))
    {
        let detached = modify_node(registry, client.id, |client| {
            if client.internet_gw_node_id == Some(gateway_id) {
                client.internet_gw_node_id = None;
            }
        })
        .await;
        if let Err(e) = detached {
            error!("failed to detach node {} from gateway {}: {}", client.id, gateway_id, e);
        }
    }
}

/// Fetches a node addressed by network and id.  Unknown nodes and network
/// mismatches are bad requests.
pub async fn node_in_network(
    registry: &dyn Registry,
    network: &str,
    node_id: NodeId,
) -> Result<Node> {
    let node = registry.get_node(node_id).await.map_err(|e| {
        if e.is_not_found() {
            Error::bad_request(e.to_string())
        } else {
            Error::from(e)
        }
    })?;
    if node.network != network {
        return Err(Error::bad_request(format!(
            "node {} is not in network {}",
            node_id, network
        )));
    }
    Ok(node)
}

fn reject_pending_delete(node: &Node) -> Result<()> {
    if node.pending_delete {
        return Err(Error::bad_request(format!(
            "node {} is pending deletion",
            node.id
        )));
    }
    Ok(())
}
