//! Data structures shared by the control plane.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! published to hosts over the broker.  Registry entities (hosts, nodes,
//! external clients, custom DNS entries) are read and written through
//! [`crate::registry::Registry`]; [`PeerUpdate`] and friends are computed
//! per host and never stored.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type HostId = Uuid;
pub type NodeId = Uuid;

/// Operating-system class reported by the agent.  Only Linux hosts may
/// route a network's internet traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsClass {
    #[default]
    Linux,
    Windows,
    Darwin,
    FreeBsd,
    Iot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firewall {
    Iptables,
    Nftables,
    #[default]
    None,
}

/// A physical or virtual machine running the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    #[serde(default)]
    pub os: OsClass,
    #[serde(default)]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub firewall_in_use: Firewall,
    #[serde(default)]
    pub is_default: bool,
}

/// Instruction the receiving host should act on for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    #[default]
    Noop,
    ForceUpdate,
    Delete,
}

/// Parameters of an internet-gateway promotion: the nodes that should route
/// their internet traffic through the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InetNodeReq {
    #[serde(default)]
    pub inet_node_client_ids: Vec<NodeId>,
}

/// A host's membership in one overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub host_id: HostId,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address6: Option<Ipv6Addr>,
    #[serde(default)]
    pub is_internet_gateway: bool,
    #[serde(default)]
    pub inet_node_req: InetNodeReq,
    /// Gateway this node sends its internet-bound traffic through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_gw_node_id: Option<NodeId>,
    #[serde(default)]
    pub is_ingress_gateway: bool,
    #[serde(default)]
    pub ingress_dns: String,
    #[serde(default)]
    pub is_relayed: bool,
    /// Set on the network's failover peer.
    #[serde(default)]
    pub is_fail_over: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_over_by: Option<NodeId>,
    #[serde(default)]
    pub fail_over_peers: BTreeSet<NodeId>,
    #[serde(default)]
    pub pending_delete: bool,
    #[serde(default)]
    pub action: NodeAction,
    #[serde(default)]
    pub version: u64,
}

impl Node {
    pub fn new(host_id: HostId, network: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id,
            network: network.into(),
            address: None,
            address6: None,
            is_internet_gateway: false,
            inet_node_req: InetNodeReq::default(),
            internet_gw_node_id: None,
            is_ingress_gateway: false,
            ingress_dns: String::new(),
            is_relayed: false,
            is_fail_over: false,
            failed_over_by: None,
            fail_over_peers: BTreeSet::new(),
            pending_delete: false,
            action: NodeAction::Noop,
            version: 0,
        }
    }

    /// Whether this node participates in peer computation.
    pub fn is_live(&self) -> bool {
        !self.pending_delete
    }
}

/// A lightweight peer attached through an ingress gateway instead of
/// running the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtClient {
    pub client_id: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_gateway_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address6: Option<Ipv6Addr>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomDns {
    pub name: String,
    pub network: String,
    pub address: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsAction {
    Insert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub action: DnsAction,
    pub name: String,
    pub address: IpAddr,
}

impl DnsRecord {
    pub fn insert(name: impl Into<String>, address: impl Into<IpAddr>) -> Self {
        Self {
            action: DnsAction::Insert,
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A node the receiving host should keep a tunnel to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: NodeId,
    pub host_id: HostId,
    pub network: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address6: Option<Ipv6Addr>,
    pub allowed_ips: Vec<IpNet>,
    pub is_internet_gateway: bool,
    pub is_ingress_gateway: bool,
}

/// An external client reachable through one of the host's ingress gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtPeer {
    pub client_id: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address6: Option<Ipv6Addr>,
    pub allowed_ips: Vec<IpNet>,
}

/// Explicit teardown instruction for an entity that no longer shows up in
/// the peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemovedPeer {
    Node {
        node_id: NodeId,
        host_id: HostId,
        network: String,
        public_key: String,
    },
    ExtClient {
        client_id: String,
        network: String,
    },
}

/// Gateway flags of one of the receiving host's own nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayState {
    pub node_id: NodeId,
    pub network: String,
    pub is_internet_gateway: bool,
    pub is_ingress_gateway: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ingress_dns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_gw_node_id: Option<NodeId>,
}

impl From<&Node> for GatewayState {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.id,
            network: node.network.clone(),
            is_internet_gateway: node.is_internet_gateway,
            is_ingress_gateway: node.is_ingress_gateway,
            ingress_dns: node.ingress_dns.clone(),
            internet_gw_node_id: node.internet_gw_node_id,
        }
    }
}

/// Full configuration snapshot for one host.  Every update replaces the
/// previous one, so a host that only sees the latest still converges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub server: String,
    pub host_id: HostId,
    pub networks: Vec<String>,
    pub peers: Vec<PeerEntry>,
    pub ext_peers: Vec<ExtPeer>,
    pub removed: Vec<RemovedPeer>,
    pub dns: Vec<DnsRecord>,
    pub gateways: Vec<GatewayState>,
}

impl PeerUpdate {
    pub fn empty(server: impl Into<String>, host_id: HostId) -> Self {
        Self {
            server: server.into(),
            host_id,
            networks: Vec::new(),
            peers: Vec::new(),
            ext_peers: Vec::new(),
            removed: Vec::new(),
            dns: Vec::new(),
            gateways: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAction {
    RequestPull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUpdate {
    pub host: Host,
    pub action: HostAction,
}

/// Telemetry forwarded verbatim to the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(pub serde_json::Value);
