//! Fixtures shared by the unit test suites.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::broker::{Broker, Delivery, LoopbackBroker};
use crate::deletion::DeletionCoordinator;
use crate::dispatch::Dispatcher;
use crate::dns::{DnsService, DnsZone};
use crate::error::{RegistryError, TransportError};
use crate::gateway::{EgressValidator, GatewayManager};
use crate::peers::PeerView;
use crate::publisher::{peers_topic, Publisher};
use crate::registry::{MemoryRegistry, NodeLocks, Registry};
use crate::types::{
    CustomDns, ExtClient, Firewall, Host, HostId, Node, NodeId, OsClass, PeerUpdate,
};

pub const SERVER_ID: &str = "srv";

pub fn host(name: &str, os: OsClass) -> Host {
    Host {
        id: Uuid::new_v4(),
        name: name.to_string(),
        os,
        public_key: format!("{name}-key"),
        endpoint: Some(format!("{name}.example.net:51821")),
        firewall_in_use: Firewall::Iptables,
        is_default: false,
    }
}

pub fn node(host: &Host, network: &str, v4: [u8; 4]) -> Node {
    let mut node = Node::new(host.id, network);
    node.address = Some(Ipv4Addr::from(v4));
    node
}

pub fn ext_client(client_id: &str, network: &str, gateway: Option<NodeId>) -> ExtClient {
    ExtClient {
        client_id: client_id.to_string(),
        network: network.to_string(),
        ingress_gateway_id: gateway,
        address: None,
        address6: None,
        enabled: true,
    }
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> T {
    serde_json::from_slice(payload).expect("payload is valid json")
}

/// Delegates to a [`MemoryRegistry`] but fails the chosen operations.
pub struct FlakyRegistry {
    inner: MemoryRegistry,
    ext_clients_down: bool,
    rejected_update: Option<NodeId>,
}

impl FlakyRegistry {
    pub fn failing_ext_clients(inner: MemoryRegistry) -> Self {
        Self {
            inner,
            ext_clients_down: true,
            rejected_update: None,
        }
    }

    /// Refuses every write of node `id`.
    pub fn failing_updates_of(inner: MemoryRegistry, id: NodeId) -> Self {
        Self {
            inner,
            ext_clients_down: false,
            rejected_update: Some(id),
        }
    }
}

#[async_trait]
impl Registry for FlakyRegistry {
    async fn list_hosts(&self) -> Result<Vec<Host>, RegistryError> {
        self.inner.list_hosts().await
    }

    async fn get_host(&self, id: HostId) -> Result<Host, RegistryError> {
        self.inner.get_host(id).await
    }

    async fn list_nodes(&self, network: Option<&str>) -> Result<Vec<Node>, RegistryError> {
        self.inner.list_nodes(network).await
    }

    async fn get_node(&self, id: NodeId) -> Result<Node, RegistryError> {
        self.inner.get_node(id).await
    }

    async fn update_node(&self, node: &Node) -> Result<Node, RegistryError> {
        if self.rejected_update == Some(node.id) {
            return Err(RegistryError::Storage("disk full".into()));
        }
        self.inner.update_node(node).await
    }

    async fn remove_node(&self, id: NodeId) -> Result<(), RegistryError> {
        self.inner.remove_node(id).await
    }

    async fn list_ext_clients(&self, network: &str) -> Result<Vec<ExtClient>, RegistryError> {
        if self.ext_clients_down {
            return Err(RegistryError::Storage("ext client table unavailable".into()));
        }
        self.inner.list_ext_clients(network).await
    }

    async fn get_ext_client(
        &self,
        network: &str,
        client_id: &str,
    ) -> Result<ExtClient, RegistryError> {
        self.inner.get_ext_client(network, client_id).await
    }

    async fn remove_ext_client(
        &self,
        network: &str,
        client_id: &str,
    ) -> Result<(), RegistryError> {
        self.inner.remove_ext_client(network, client_id).await
    }

    async fn list_custom_dns(&self, network: &str) -> Result<Vec<CustomDns>, RegistryError> {
        self.inner.list_custom_dns(network).await
    }
}

/// Never acknowledges a publish.
pub struct StalledBroker;

#[async_trait]
impl Broker for StalledBroker {
    async fn publish(
        &self,
        _topic: &str,
        _delivery: Delivery,
        _payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

/// Refuses the given topics and forwards everything else.
pub struct RejectingBroker {
    inner: Arc<LoopbackBroker>,
    rejected: HashSet<String>,
}

impl RejectingBroker {
    pub fn new(inner: Arc<LoopbackBroker>, topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner,
            rejected: topics.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Broker for RejectingBroker {
    async fn publish(
        &self,
        topic: &str,
        delivery: Delivery,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.rejected.contains(topic) {
            return Err(TransportError::Broker {
                topic: topic.to_string(),
                reason: "rejected".into(),
            });
        }
        self.inner.publish(topic, delivery, payload).await
    }
}

/// A control plane wired to an in-memory registry and a loopback broker.
pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub broker: Arc<LoopbackBroker>,
    pub publisher: Arc<Publisher>,
    pub broadcaster: Arc<Broadcaster>,
    pub dispatcher: Dispatcher,
    pub locks: Arc<NodeLocks>,
    pub dns: DnsService,
    pub gateways: Arc<GatewayManager>,
    pub deletion: Arc<DeletionCoordinator>,
}

impl Harness {
    pub async fn new(dns_mode: bool) -> Self {
        Self::with_options(dns_mode, true).await
    }

    pub async fn with_options(dns_mode: bool, enabled: bool) -> Self {
        let registry = Arc::new(MemoryRegistry::default());
        let broker = Arc::new(LoopbackBroker::default());
        let publisher = Arc::new(Publisher::new(
            broker.clone(),
            SERVER_ID,
            Duration::from_secs(1),
        ));
        let dns = DnsService::new(registry.clone(), DnsZone::default());
        let peers = PeerView::new(
            SERVER_ID,
            registry.clone(),
            dns_mode.then(|| dns.aggregator().clone()),
        );
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            publisher.clone(),
            peers,
            enabled,
        ));
        let dispatcher = Dispatcher::spawn(4, 64);
        let locks = Arc::new(NodeLocks::default());
        let gateways = Arc::new(GatewayManager::new(
            registry.clone(),
            Arc::new(EgressValidator::new(registry.clone())),
            broadcaster.clone(),
            dispatcher.clone(),
            locks.clone(),
        ));
        let deletion = Arc::new(DeletionCoordinator::new(
            registry.clone(),
            broadcaster.clone(),
            dns_mode.then(|| dns.clone()),
            dispatcher.clone(),
            locks.clone(),
        ));

        Self {
            registry,
            broker,
            publisher,
            broadcaster,
            dispatcher,
            locks,
            dns,
            gateways,
            deletion,
        }
    }

    pub fn gateway_manager(&self, failover: bool) -> GatewayManager {
        GatewayManager::new(
            self.registry.clone(),
            Arc::new(EgressValidator::new(self.registry.clone())),
            self.broadcaster.clone(),
            self.dispatcher.clone(),
            self.locks.clone(),
        )
        .with_failover(failover)
    }

    /// Two Linux hosts, `alpha` at 10.0.0.1 and `beta` at 10.0.0.2, each
    /// with one node in `network`.
    pub async fn pair(&self, network: &str) -> (Host, Host) {
        let a = host("alpha", OsClass::Linux);
        let b = host("beta", OsClass::Linux);
        self.registry.insert_host(a.clone()).await;
        self.registry.insert_host(b.clone()).await;
        self.registry.insert_node(node(&a, network, [10, 0, 0, 1])).await;
        self.registry.insert_node(node(&b, network, [10, 0, 0, 2])).await;
        (a, b)
    }

    /// The first stored node of `host`.
    pub async fn node_of(&self, host: &Host) -> Node {
        self.registry
            .list_nodes(None)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.host_id == host.id)
            .expect("host has a node")
    }

    pub async fn peer_updates(&self, host: &Host) -> Vec<PeerUpdate> {
        self.broker
            .on_topic(&peers_topic(host.id, SERVER_ID))
            .await
            .iter()
            .map(|p| decode(&p.payload))
            .collect()
    }
}
