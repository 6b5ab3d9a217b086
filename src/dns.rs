//! DNS record aggregation and the served overlay zone.
//!
//! Records for a network come from three independent sources, always in the
//! same order: nodes, external clients, custom entries.  Consumers apply
//! them in order, so a custom entry overrides an earlier record of the same
//! name.  A source that fails to load contributes nothing.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::RwLock;

use crate::registry::Registry;
use crate::types::DnsRecord;

#[derive(Clone)]
pub struct DnsAggregator {
    registry: Arc<dyn Registry>,
}

impl DnsAggregator {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    pub async fn build(&self, network: &str) -> Vec<DnsRecord> {
        let mut records = self.node_records(network).await;
        records.extend(self.ext_client_records(network).await);
        records.extend(self.custom_records(network).await);
        records
    }

    async fn node_records(&self, network: &str) -> Vec<DnsRecord> {
        let nodes = match self.registry.list_nodes(Some(network)).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("error retrieving nodes of network {}: {}", network, e);
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for node in nodes.iter().filter(|n| n.is_live()) {
            let host = match self.registry.get_host(node.host_id).await {
                Ok(host) => host,
                Err(e) => {
                    error!("error retrieving host {} for dns update: {}", node.host_id, e);
                    continue;
                }
            };
            let name = format!("{}.{}", host.name, node.network);
            push_addresses(&mut records, &name, node.address, node.address6);
        }
        records
    }

    async fn ext_client_records(&self, network: &str) -> Vec<DnsRecord> {
        let clients = match self.registry.list_ext_clients(network).await {
            Ok(clients) => clients,
            Err(e) => {
                error!("error retrieving ext clients of network {}: {}", network, e);
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for client in &clients {
            let name = format!("{}.{}", client.client_id, client.network);
            push_addresses(&mut records, &name, client.address, client.address6);
        }
        records
    }

    async fn custom_records(&self, network: &str) -> Vec<DnsRecord> {
        match self.registry.list_custom_dns(network).await {
            Ok(entries) => entries
                .into_iter()
                .map(|e| DnsRecord::insert(format!("{}.{}", e.name, e.network), e.address))
                .collect(),
            Err(e) => {
                error!("error retrieving custom dns entries of {}: {}", network, e);
                Vec::new()
            }
        }
    }
}

fn push_addresses(
    records: &mut Vec<DnsRecord>,
    name: &str,
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
) {
    if let Some(addr) = v4 {
        records.push(DnsRecord::insert(name, addr));
    }
    if let Some(addr) = v6 {
        records.push(DnsRecord::insert(name, addr));
    }
}

/// Addresses a name currently resolves to, one per family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneEntry {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

impl ZoneEntry {
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> {
        self.v4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.v6.map(IpAddr::V6))
    }
}

#[derive(Debug, Default)]
struct ZoneState {
    by_network: HashMap<String, Vec<DnsRecord>>,
    names: HashMap<String, ZoneEntry>,
}

/// Names served by the DNS server, rebuilt per network on refresh.
#[derive(Debug, Clone, Default)]
pub struct DnsZone {
    state: Arc<RwLock<ZoneState>>,
}

impl DnsZone {
    pub async fn replace_network(&self, network: &str, records: Vec<DnsRecord>) {
        let mut state = self.state.write().await;
        state.by_network.insert(network.to_string(), records);
        let mut names: HashMap<String, ZoneEntry> = HashMap::new();
        for record in state.by_network.values().flatten() {
            let entry = names.entry(record.name.to_lowercase()).or_default();
            match record.address {
                IpAddr::V4(addr) => entry.v4 = Some(addr),
                IpAddr::V6(addr) => entry.v6 = Some(addr),
            }
        }
        state.names = names;
    }

    pub async fn lookup(&self, name: &str) -> Option<ZoneEntry> {
        self.state
            .read()
            .await
            .names
            .get(&name.to_lowercase())
            .copied()
    }

    /// Number of distinct names served.
    pub async fn len(&self) -> usize {
        self.state.read().await.names.len()
    }
}

/// Rebuilds zone contents from the registry.
#[derive(Clone)]
pub struct DnsService {
    aggregator: DnsAggregator,
    zone: DnsZone,
}

impl DnsService {
    pub fn new(registry: Arc<dyn Registry>, zone: DnsZone) -> Self {
        Self {
            aggregator: DnsAggregator::new(registry),
            zone,
        }
    }

    pub fn aggregator(&self) -> &DnsAggregator {
        &self.aggregator
    }

    pub fn zone(&self) -> &DnsZone {
        &self.zone
    }

    pub async fn refresh(&self, network: &str) {
        let records = self.aggregator.build(network).await;
        debug!("refreshed {} dns records for {}", records.len(), network);
        self.zone.replace_network(network, records).await;
    }

    /// Refreshes every network that currently has nodes.
    pub async fn refresh_all(&self) -> Result<(), crate::error::RegistryError> {
        let nodes = self.aggregator.registry.list_nodes(None).await?;
        let networks: BTreeSet<String> = nodes.into_iter().map(|n| n.network).collect();
        for network in &networks {
            self.refresh(network).await;
        }
        info!(
            "dns zone holds {} names across {} networks",
            self.zone.len().await,
            networks.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::testing::{ext_client, host, node, FlakyRegistry};
    use crate::types::{CustomDns, OsClass};

    #[tokio::test]
    async fn records_ordered_node_client_custom() {
        let registry = Arc::new(MemoryRegistry::default());
        let h = host("alpha", OsClass::Linux);
        registry.insert_host(h.clone()).await;
        registry.insert_node(node(&h, "net1", [10, 0, 0, 1])).await;
        let mut client = ext_client("alpha", "net1", None);
        client.address = Some(Ipv4Addr::new(10, 0, 0, 2));
        registry.insert_ext_client(client).await;
        registry
            .insert_custom_dns(CustomDns {
                name: "alpha".into(),
                network: "net1".into(),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            })
            .await;

        let records = DnsAggregator::new(registry).build("net1").await;
        let addrs: Vec<String> = records.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(addrs, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert!(records.iter().all(|r| r.name == "alpha.net1"));
    }

    #[tokio::test]
    async fn one_record_per_present_family() {
        let registry = Arc::new(MemoryRegistry::default());
        let h = host("beta", OsClass::Linux);
        registry.insert_host(h.clone()).await;
        let mut dual = node(&h, "net1", [10, 0, 0, 1]);
        dual.address6 = Some("fd00::1".parse().unwrap());
        registry.insert_node(dual).await;
        let mut v6_only = ext_client("phone", "net1", None);
        v6_only.address6 = Some("fd00::2".parse().unwrap());
        registry.insert_ext_client(v6_only).await;

        let records = DnsAggregator::new(registry).build("net1").await;
        let addrs: Vec<String> = records.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(addrs, ["10.0.0.1", "fd00::1", "fd00::2"]);
        assert_eq!(records[2].name, "phone.net1");
    }

    #[tokio::test]
    async fn failing_source_degrades_to_empty() {
        let inner = MemoryRegistry::default();
        let h = host("alpha", OsClass::Linux);
        inner.insert_host(h.clone()).await;
        inner.insert_node(node(&h, "net1", [10, 0, 0, 1])).await;
        let mut client = ext_client("phone", "net1", None);
        client.address = Some(Ipv4Addr::new(10, 0, 0, 9));
        inner.insert_ext_client(client).await;
        let registry = Arc::new(FlakyRegistry::failing_ext_clients(inner));

        let records = DnsAggregator::new(registry).build("net1").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "alpha.net1");
    }

    #[tokio::test]
    async fn pending_delete_nodes_are_skipped() {
        let registry = Arc::new(MemoryRegistry::default());
        let h = host("alpha", OsClass::Linux);
        registry.insert_host(h.clone()).await;
        let mut gone = node(&h, "net1", [10, 0, 0, 1]);
        gone.pending_delete = true;
        registry.insert_node(gone).await;

        assert!(DnsAggregator::new(registry).build("net1").await.is_empty());
    }

    #[tokio::test]
    async fn zone_applies_records_in_order() {
        let zone = DnsZone::default();
        zone.replace_network(
            "net1",
            vec![
                DnsRecord::insert("alpha.net1", Ipv4Addr::new(10, 0, 0, 1)),
                DnsRecord::insert("alpha.net1", "fd00::1".parse::<Ipv6Addr>().unwrap()),
                DnsRecord::insert("Alpha.net1", Ipv4Addr::new(10, 0, 0, 3)),
            ],
        )
        .await;

        let entry = zone.lookup("ALPHA.net1").await.unwrap();
        assert_eq!(entry.v4, Some(Ipv4Addr::new(10, 0, 0, 3)));
        assert_eq!(entry.v6, Some("fd00::1".parse().unwrap()));

        zone.replace_network("net1", Vec::new()).await;
        assert!(zone.lookup("alpha.net1").await.is_none());
    }

    #[tokio::test]
    async fn refresh_all_covers_every_network() {
        let registry = Arc::new(MemoryRegistry::default());
        let h = host("alpha", OsClass::Linux);
        registry.insert_host(h.clone()).await;
        registry.insert_node(node(&h, "net1", [10, 0, 0, 1])).await;
        registry.insert_node(node(&h, "net2", [10, 1, 0, 1])).await;

        let service = DnsService::new(registry, DnsZone::default());
        service.refresh_all().await.unwrap();
        assert_eq!(service.zone().len().await, 2);
        assert!(service.zone().lookup("alpha.net2").await.is_some());
    }
}
