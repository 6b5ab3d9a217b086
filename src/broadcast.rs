//! Fan-out of computed updates to hosts.
//!
//! Each host is published to independently: one host failing does not stop
//! delivery to the rest.  Only the registry reads the fan-out itself depends
//! on are returned as errors; per-host failures are logged and counted.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info};

use crate::error::Result;
use crate::peers::{PeerView, Snapshot};
use crate::publisher::{host_update_topic, node_update_topic, peers_topic, Publisher};
use crate::registry::Registry;
use crate::types::{ExtClient, Host, HostAction, HostUpdate, Node, NodeAction, OsClass};

/// Hosts published to concurrently during a fan-out.
const FANOUT_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutSummary {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Broadcaster {
    registry: Arc<dyn Registry>,
    publisher: Arc<Publisher>,
    peers: PeerView,
    enabled: bool,
}

impl Broadcaster {
    /// With `enabled` false (no message-queue backend) every operation is a
    /// no-op.
    pub fn new(
        registry: Arc<dyn Registry>,
        publisher: Arc<Publisher>,
        peers: PeerView,
        enabled: bool,
    ) -> Self {
        Self {
            registry,
            publisher,
            peers,
            enabled,
        }
    }

    /// Sends every host its current peer view.
    pub async fn publish_peer_update(&self) -> Result<FanoutSummary> {
        self.fan_out(None, &[], |_| true).await
    }

    /// Sends every host its peer view with `node` announced as removed.
    pub async fn publish_deleted_node_peer_update(
        &self,
        node: &Node,
        related_clients: &[ExtClient],
    ) -> Result<FanoutSummary> {
        self.fan_out(Some(node), related_clients, |_| true).await
    }

    /// Sends every host except IoT ones its peer view with `client`
    /// announced as removed.
    pub async fn publish_deleted_client_peer_update(
        &self,
        client: &ExtClient,
    ) -> Result<FanoutSummary> {
        self.fan_out(None, std::slice::from_ref(client), |h| h.os != OsClass::Iot)
            .await
    }

    pub async fn publish_single_host_peer_update(
        &self,
        host: &Host,
        snapshot: &Snapshot,
        deleted_node: Option<&Node>,
        deleted_clients: &[ExtClient],
    ) -> Result<()> {
        let update = self
            .peers
            .compute(host, snapshot, deleted_node, deleted_clients)
            .await?;
        let topic = peers_topic(host.id, self.publisher.server_id());
        self.publisher.publish(host, &topic, &update).await
    }

    /// Sends `node` to its owning host.
    pub async fn node_update(&self, node: &Node) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let host = self.registry.get_host(node.host_id).await?;
        debug!("publishing node update to {}", node.id);
        let topic = node_update_topic(&node.network, node.id);
        self.publisher.publish(&host, &topic, node).await
    }

    pub async fn host_update(&self, update: &HostUpdate) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        debug!("publishing host update to {}", update.host.id);
        let topic = host_update_topic(update.host.id, self.publisher.server_id());
        self.publisher.publish(&update.host, &topic, update).await
    }

    /// Asks every host to pull its configuration and every node to force an
    /// update after a server restart.
    pub async fn server_start_notify(&self) -> Result<FanoutSummary> {
        let mut summary = FanoutSummary::default();
        if !self.enabled {
            return Ok(summary);
        }
        for host in self.registry.list_hosts().await? {
            let update = HostUpdate {
                host,
                action: HostAction::RequestPull,
            };
            match self.host_update(&update).await {
                Ok(()) => summary.delivered += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!("error notifying host {} of a server startup: {}", update.host.id, e);
                }
            }
        }
        for mut node in self.registry.list_nodes(None).await? {
            node.action = NodeAction::ForceUpdate;
            match self.node_update(&node).await {
                Ok(()) => summary.delivered += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!("error notifying node {} of a server startup: {}", node.id, e);
                }
            }
        }
        info!(
            "server start notification: {} delivered, {} failed",
            summary.delivered, summary.failed
        );
        Ok(summary)
    }

    async fn fan_out<F>(
        &self,
        deleted_node: Option<&Node>,
        deleted_clients: &[ExtClient],
        include: F,
    ) -> Result<FanoutSummary>
    where
        F: Fn(&Host) -> bool,
    {
        let mut summary = FanoutSummary::default();
        if !self.enabled {
            return Ok(summary);
        }
        let snapshot = match Snapshot::load(self.registry.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("error loading hosts and nodes for peer update: {}", e);
                return Err(e.into());
            }
        };

        let targets: Vec<&Host> = snapshot
            .hosts
            .values()
            .filter(|h| {
                let keep = include(*h);
                if !keep {
                    summary.skipped += 1;
                }
                keep
            })
            .collect();

        let snapshot = &snapshot;
        let publishes: Vec<BoxFuture<'_, (&Host, Result<()>)>> = targets
            .into_iter()
            .map(|host| {
                async move {
                    let result = self
                        .publish_single_host_peer_update(
                            host,
                            snapshot,
                            deleted_node,
                            deleted_clients,
                        )
                        .await;
                    (host, result)
                }
                .boxed()
            })
            .collect();
        let results: Vec<(&Host, Result<()>)> = stream::iter(publishes)
            .buffer_unordered(FANOUT_CONCURRENCY)
            .collect()
            .await;

        for (host, result) in results {
            match result {
                Ok(()) => summary.delivered += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!("failed to publish peer update to host {}: {}", host.id, e);
                }
            }
        }
        debug!(
            "peer update fan-out: {} delivered, {} failed, {} skipped",
            summary.delivered, summary.failed, summary.skipped
        );
        Ok(summary)
    }
}
