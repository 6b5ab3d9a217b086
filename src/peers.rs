//! Per-host peer view.
//!
//! [`PeerView::compute`] turns a registry [`Snapshot`] into the full
//! [`PeerUpdate`] one host should apply.  Deleted entities are passed as
//! overlays: they are left out of the peer list even if the snapshot still
//! contains them, and announced through explicit removal entries.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::dns::DnsAggregator;
use crate::error::{RegistryError, Result};
use crate::registry::Registry;
use crate::types::{
    ExtClient, ExtPeer, GatewayState, Host, HostId, Node, PeerEntry, PeerUpdate, RemovedPeer,
};

/// Hosts and nodes read together from the registry.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub hosts: HashMap<HostId, Host>,
    pub nodes: Vec<Node>,
}

impl Snapshot {
    pub async fn load(registry: &dyn Registry) -> std::result::Result<Self, RegistryError> {
        let hosts = registry.list_hosts().await?;
        let nodes = registry.list_nodes(None).await?;
        Ok(Self {
            hosts: hosts.into_iter().map(|h| (h.id, h)).collect(),
            nodes,
        })
    }
}

#[derive(Clone)]
pub struct PeerView {
    server_id: String,
    registry: Arc<dyn Registry>,
    dns: Option<DnsAggregator>,
}

impl PeerView {
    /// `dns` is only set when DNS mode is on.
    pub fn new(
        server_id: impl Into<String>,
        registry: Arc<dyn Registry>,
        dns: Option<DnsAggregator>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            registry,
            dns,
        }
    }

    pub async fn compute(
        &self,
        host: &Host,
        snapshot: &Snapshot,
        deleted_node: Option<&Node>,
        deleted_clients: &[ExtClient],
    ) -> Result<PeerUpdate> {
        let deleted_id = deleted_node.map(|n| n.id);
        let mut update = PeerUpdate::empty(self.server_id.clone(), host.id);

        let own: Vec<&Node> = snapshot
            .nodes
            .iter()
            .filter(|n| n.host_id == host.id && n.is_live() && Some(n.id) != deleted_id)
            .collect();
        let networks: BTreeSet<&str> = own.iter().map(|n| n.network.as_str()).collect();
        update.networks = networks.iter().map(|n| n.to_string()).collect();
        update.gateways = own.iter().map(|n| GatewayState::from(*n)).collect();

        for peer in snapshot.nodes.iter().filter(|n| {
            n.host_id != host.id
                && n.is_live()
                && Some(n.id) != deleted_id
                && networks.contains(n.network.as_str())
        }) {
            let routes_internet = own
                .iter()
                .any(|n| n.network == peer.network && n.internet_gw_node_id == Some(peer.id));
            update
                .peers
                .push(peer_entry(peer, snapshot.hosts.get(&peer.host_id), routes_internet));
        }

        for gateway in own.iter().filter(|n| n.is_ingress_gateway) {
            let clients = self.registry.list_ext_clients(&gateway.network).await?;
            update.ext_peers.extend(
                clients
                    .iter()
                    .filter(|c| {
                        c.enabled
                            && c.ingress_gateway_id == Some(gateway.id)
                            && !deleted_clients.iter().any(|d| same_client(c, d))
                    })
                    .map(ext_peer),
            );
        }

        if let Some(deleted) = deleted_node {
            if deleted.host_id != host.id && networks.contains(deleted.network.as_str()) {
                let public_key = match snapshot.hosts.get(&deleted.host_id) {
                    Some(owner) => owner.public_key.clone(),
                    None => self.registry.get_host(deleted.host_id).await?.public_key,
                };
                update.removed.push(RemovedPeer::Node {
                    node_id: deleted.id,
                    host_id: deleted.host_id,
                    network: deleted.network.clone(),
                    public_key,
                });
            }
        }
        for client in deleted_clients
            .iter()
            .filter(|c| networks.contains(c.network.as_str()))
        {
            update.removed.push(RemovedPeer::ExtClient {
                client_id: client.client_id.clone(),
                network: client.network.clone(),
            });
        }

        if let Some(dns) = &self.dns {
            let stale = stale_addresses(deleted_node, deleted_clients);
            for network in &networks {
                let records = dns.build(network).await;
                update.dns.extend(
                    records
                        .into_iter()
                        .filter(|r| !stale.contains(&(*network, r.address))),
                );
            }
        }

        Ok(update)
    }
}

fn peer_entry(node: &Node, host: Option<&Host>, routes_internet: bool) -> PeerEntry {
    let mut allowed_ips = host_routes(node.address.map(IpAddr::V4), node.address6.map(IpAddr::V6));
    if routes_internet {
        allowed_ips.push(IpNet::V4(Ipv4Net::default()));
        allowed_ips.push(IpNet::V6(Ipv6Net::default()));
    }
    PeerEntry {
        node_id: node.id,
        host_id: node.host_id,
        network: node.network.clone(),
        public_key: host.map(|h| h.public_key.clone()).unwrap_or_default(),
        endpoint: host.and_then(|h| h.endpoint.clone()),
        address: node.address,
        address6: node.address6,
        allowed_ips,
        is_internet_gateway: node.is_internet_gateway,
        is_ingress_gateway: node.is_ingress_gateway,
    }
}

fn ext_peer(client: &ExtClient) -> ExtPeer {
    ExtPeer {
        client_id: client.client_id.clone(),
        network: client.network.clone(),
        address: client.address,
        address6: client.address6,
        allowed_ips: host_routes(
            client.address.map(IpAddr::V4),
            client.address6.map(IpAddr::V6),
        ),
    }
}

fn host_routes(v4: Option<IpAddr>, v6: Option<IpAddr>) -> Vec<IpNet> {
    v4.into_iter().chain(v6).map(IpNet::from).collect()
}

fn same_client(a: &ExtClient, b: &ExtClient) -> bool {
    a.network == b.network && a.client_id == b.client_id
}

/// Addresses of the deleted entities, keyed by the network they held them in.
fn stale_addresses<'a>(
    deleted_node: Option<&'a Node>,
    deleted_clients: &'a [ExtClient],
) -> BTreeSet<(&'a str, IpAddr)> {
    let mut stale = BTreeSet::new();
    if let Some(node) = deleted_node {
        let network = node.network.as_str();
        stale.extend(node.address.map(|a| (network, IpAddr::V4(a))));
        stale.extend(node.address6.map(|a| (network, IpAddr::V6(a))));
    }
    for client in deleted_clients {
        let network = client.network.as_str();
        stale.extend(client.address.map(|a| (network, IpAddr::V4(a))));
        stale.extend(client.address6.map(|a| (network, IpAddr::V6(a))));
    }
    stale
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::testing::{ext_client, host, node};
    use crate::types::OsClass;

    async fn seeded() -> (Arc<MemoryRegistry>, Vec<Host>, Vec<Node>) {
        let registry = Arc::new(MemoryRegistry::default());
        let hosts = vec![
            host("alpha", OsClass::Linux),
            host("beta", OsClass::Linux),
            host("gamma", OsClass::Windows),
        ];
        for h in &hosts {
            registry.insert_host(h.clone()).await;
        }
        let nodes = vec![
            registry.insert_node(node(&hosts[0], "net1", [10, 0, 0, 1])).await,
            registry.insert_node(node(&hosts[1], "net1", [10, 0, 0, 2])).await,
            registry.insert_node(node(&hosts[2], "net2", [10, 1, 0, 3])).await,
        ];
        (registry, hosts, nodes)
    }

    fn peer_ids(update: &PeerUpdate) -> BTreeSet<Uuid> {
        update.peers.iter().map(|p| p.node_id).collect()
    }

    #[tokio::test]
    async fn peers_share_network_and_exclude_self() {
        let (registry, hosts, nodes) = seeded().await;
        let view = PeerView::new("srv", registry.clone(), None);
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();

        let update = view.compute(&hosts[0], &snapshot, None, &[]).await.unwrap();
        assert_eq!(update.server, "srv");
        assert_eq!(update.networks, ["net1"]);
        assert_eq!(peer_ids(&update), BTreeSet::from([nodes[1].id]));
        assert_eq!(update.peers[0].public_key, hosts[1].public_key);
        assert_eq!(
            update.peers[0].allowed_ips,
            vec!["10.0.0.2/32".parse::<IpNet>().unwrap()]
        );
        assert_eq!(update.gateways.len(), 1);
        assert_eq!(update.gateways[0].node_id, nodes[0].id);
    }

    #[tokio::test]
    async fn host_without_peers_gets_empty_update() {
        let (registry, hosts, _) = seeded().await;
        let view = PeerView::new("srv", registry.clone(), None);
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();

        let update = view.compute(&hosts[2], &snapshot, None, &[]).await.unwrap();
        assert_eq!(update.networks, ["net2"]);
        assert!(update.peers.is_empty());
        assert!(update.removed.is_empty());

        let stranger = host("delta", OsClass::Linux);
        let update = view.compute(&stranger, &snapshot, None, &[]).await.unwrap();
        assert!(update.networks.is_empty());
        assert!(update.peers.is_empty());
    }

    #[tokio::test]
    async fn deleted_node_is_announced_and_excluded() {
        let (registry, hosts, nodes) = seeded().await;
        let view = PeerView::new("srv", registry.clone(), None);
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();

        let update = view
            .compute(&hosts[0], &snapshot, Some(&nodes[1]), &[])
            .await
            .unwrap();
        assert!(update.peers.is_empty());
        assert_eq!(
            update.removed,
            vec![RemovedPeer::Node {
                node_id: nodes[1].id,
                host_id: hosts[1].id,
                network: "net1".into(),
                public_key: hosts[1].public_key.clone(),
            }]
        );

        // The owner drops the node from its own state and gets no removal entry.
        let owner = view
            .compute(&hosts[1], &snapshot, Some(&nodes[1]), &[])
            .await
            .unwrap();
        assert!(owner.networks.is_empty());
        assert!(owner.removed.is_empty());
    }

    #[tokio::test]
    async fn deleted_node_with_vanished_host_surfaces_registry_error() {
        let (registry, hosts, _) = seeded().await;
        let view = PeerView::new("srv", registry.clone(), None);
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();
        let orphan = node(&host("ghost", OsClass::Linux), "net1", [10, 0, 0, 7]);

        let err = view
            .compute(&hosts[0], &snapshot, Some(&orphan), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Registry(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn internet_gateway_peer_carries_default_routes() {
        let (registry, hosts, nodes) = seeded().await;
        let mut client = nodes[0].clone();
        client.internet_gw_node_id = Some(nodes[1].id);
        registry.update_node(&client).await.unwrap();
        let mut gateway = nodes[1].clone();
        gateway.is_internet_gateway = true;
        registry.update_node(&gateway).await.unwrap();

        let view = PeerView::new("srv", registry.clone(), None);
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();
        let update = view.compute(&hosts[0], &snapshot, None, &[]).await.unwrap();
        let peer = &update.peers[0];
        assert!(peer.is_internet_gateway);
        assert!(peer.allowed_ips.contains(&"0.0.0.0/0".parse().unwrap()));
        assert!(peer.allowed_ips.contains(&"::/0".parse().unwrap()));
        assert_eq!(update.gateways[0].internet_gw_node_id, Some(nodes[1].id));

        // The gateway itself does not route through its client.
        let update = view.compute(&hosts[1], &snapshot, None, &[]).await.unwrap();
        assert_eq!(update.peers[0].allowed_ips.len(), 1);
    }

    #[tokio::test]
    async fn ingress_gateway_lists_its_clients_minus_deleted() {
        let (registry, hosts, nodes) = seeded().await;
        let mut gateway = nodes[0].clone();
        gateway.is_ingress_gateway = true;
        let gateway = registry.update_node(&gateway).await.unwrap();
        let mut phone = ext_client("phone", "net1", Some(gateway.id));
        phone.address = Some(Ipv4Addr::new(10, 0, 0, 20));
        let mut laptop = ext_client("laptop", "net1", Some(gateway.id));
        laptop.address = Some(Ipv4Addr::new(10, 0, 0, 21));
        registry.insert_ext_client(phone.clone()).await;
        registry.insert_ext_client(laptop).await;

        let view = PeerView::new("srv", registry.clone(), None);
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();
        let update = view
            .compute(&hosts[0], &snapshot, None, std::slice::from_ref(&phone))
            .await
            .unwrap();
        let ext: Vec<&str> = update.ext_peers.iter().map(|p| p.client_id.as_str()).collect();
        assert_eq!(ext, ["laptop"]);
        assert_eq!(
            update.removed,
            vec![RemovedPeer::ExtClient {
                client_id: "phone".into(),
                network: "net1".into(),
            }]
        );

        // Hosts outside net1 hear nothing about the client.
        let other = view
            .compute(&hosts[2], &snapshot, None, std::slice::from_ref(&phone))
            .await
            .unwrap();
        assert!(other.removed.is_empty());
    }

    #[tokio::test]
    async fn dns_records_attached_without_deleted_addresses() {
        let (registry, hosts, nodes) = seeded().await;
        let view = PeerView::new(
            "srv",
            registry.clone(),
            Some(DnsAggregator::new(registry.clone())),
        );
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();

        let update = view.compute(&hosts[0], &snapshot, None, &[]).await.unwrap();
        let names: BTreeSet<&str> = update.dns.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, BTreeSet::from(["alpha.net1", "beta.net1"]));

        let update = view
            .compute(&hosts[0], &snapshot, Some(&nodes[1]), &[])
            .await
            .unwrap();
        let names: Vec<&str> = update.dns.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["alpha.net1"]);
    }

    #[tokio::test]
    async fn reused_address_in_other_network_keeps_its_record() {
        let (registry, hosts, nodes) = seeded().await;
        registry.insert_node(node(&hosts[0], "net3", [10, 0, 0, 9])).await;
        // Same address as the deleted beta node, different network.
        registry.insert_node(node(&hosts[2], "net3", [10, 0, 0, 2])).await;
        let view = PeerView::new(
            "srv",
            registry.clone(),
            Some(DnsAggregator::new(registry.clone())),
        );
        let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();

        let update = view
            .compute(&hosts[0], &snapshot, Some(&nodes[1]), &[])
            .await
            .unwrap();
        let names: BTreeSet<&str> = update.dns.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            BTreeSet::from(["alpha.net1", "alpha.net3", "gamma.net3"])
        );
    }

    /// A consumer that treats every update as the complete desired state.
    fn apply(current: &mut BTreeSet<Uuid>, update: &PeerUpdate) {
        *current = peer_ids(update);
        for removed in &update.removed {
            if let RemovedPeer::Node { node_id, .. } = removed {
                current.remove(node_id);
            }
        }
    }

    #[derive(Debug, Clone)]
    enum Change {
        Join(usize, bool),
        Delete(usize),
        Promote(usize),
    }

    fn change() -> impl Strategy<Value = Change> {
        prop_oneof![
            (0..4usize, any::<bool>()).prop_map(|(h, second)| Change::Join(h, second)),
            (0..8usize).prop_map(Change::Delete),
            (0..8usize).prop_map(Change::Promote),
        ]
    }

    proptest! {
        #[test]
        fn latest_snapshot_matches_full_replay(changes in prop::collection::vec(change(), 1..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let registry = Arc::new(MemoryRegistry::default());
                let hosts: Vec<Host> = (0..4)
                    .map(|i| host(&format!("h{i}"), OsClass::Linux))
                    .collect();
                for h in &hosts {
                    registry.insert_host(h.clone()).await;
                }
                registry.insert_node(node(&hosts[0], "net1", [10, 0, 0, 1])).await;
                let view = PeerView::new("srv", registry.clone(), None);

                let mut updates = Vec::new();
                for (step, change) in changes.iter().enumerate() {
                    let nodes = registry.list_nodes(None).await.unwrap();
                    let mut deleted = None;
                    match change {
                        Change::Join(h, second) => {
                            let net = if *second { "net2" } else { "net1" };
                            registry
                                .insert_node(node(&hosts[*h], net, [10, 0, 1, step as u8]))
                                .await;
                        }
                        Change::Delete(i) => {
                            if let Some(victim) = nodes.get(i % nodes.len().max(1)) {
                                registry.remove_node(victim.id).await.unwrap();
                                deleted = Some(victim.clone());
                            }
                        }
                        Change::Promote(i) => {
                            if let Some(target) = nodes.get(i % nodes.len().max(1)) {
                                let mut target = target.clone();
                                target.is_internet_gateway = true;
                                registry.update_node(&target).await.unwrap();
                            }
                        }
                    }
                    let snapshot = Snapshot::load(registry.as_ref()).await.unwrap();
                    updates.push(
                        view.compute(&hosts[0], &snapshot, deleted.as_ref(), &[])
                            .await
                            .unwrap(),
                    );
                }

                let mut replayed = BTreeSet::new();
                for update in &updates {
                    apply(&mut replayed, update);
                }
                let mut latest_only = BTreeSet::new();
                apply(&mut latest_only, updates.last().unwrap());
                assert_eq!(replayed, latest_only);
            });
        }
    }
}
