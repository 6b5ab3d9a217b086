//! Periodic housekeeping run on forced sync ticks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;
use crate::publisher::Publisher;
use crate::registry::Registry;
use crate::types::{Host, HostId, Metrics};

#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Re-reads the host record this server runs on.
    async fn refresh_server_host(&self) -> Result<()>;

    /// Pushes telemetry when the checkpoint interval has elapsed.  Returns
    /// whether anything was pushed.
    async fn checkpoint(&self) -> Result<bool>;
}

pub struct ServerMaintenance {
    registry: Arc<dyn Registry>,
    publisher: Arc<Publisher>,
    server_host_id: Option<HostId>,
    server_host: RwLock<Option<Host>>,
    interval: Duration,
    last_checkpoint: Mutex<Instant>,
}

impl ServerMaintenance {
    /// The first checkpoint is due one `interval` after construction.
    pub fn new(
        registry: Arc<dyn Registry>,
        publisher: Arc<Publisher>,
        server_host_id: Option<HostId>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            publisher,
            server_host_id,
            server_host: RwLock::new(None),
            interval,
            last_checkpoint: Mutex::new(Instant::now()),
        }
    }

    pub async fn server_host(&self) -> Option<Host> {
        self.server_host.read().await.clone()
    }

    async fn summary(&self) -> Result<Metrics> {
        let hosts = self.registry.list_hosts().await?;
        let nodes = self.registry.list_nodes(None).await?;
        let networks: BTreeSet<&str> = nodes.iter().map(|n| n.network.as_str()).collect();
        let mut ext_clients = 0;
        for network in &networks {
            ext_clients += self.registry.list_ext_clients(network).await?.len();
        }
        let server_host = self.server_host().await.map(|h| h.name);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Ok(Metrics(json!({
            "server": self.publisher.server_id(),
            "server_host": server_host,
            "hosts": hosts.len(),
            "nodes": nodes.len(),
            "networks": networks.len(),
            "internet_gateways": nodes.iter().filter(|n| n.is_internet_gateway).count(),
            "ingress_gateways": nodes.iter().filter(|n| n.is_ingress_gateway).count(),
            "ext_clients": ext_clients,
            "timestamp": timestamp,
        })))
    }
}

#[async_trait]
impl Maintenance for ServerMaintenance {
    async fn refresh_server_host(&self) -> Result<()> {
        let Some(id) = self.server_host_id else {
            return Ok(());
        };
        match self.registry.get_host(id).await {
            Ok(host) => {
                debug!("server host is {} ({})", host.name, host.id);
                *self.server_host.write().await = Some(host);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("server host {} is not registered", id);
                *self.server_host.write().await = None;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn checkpoint(&self) -> Result<bool> {
        let mut last = self.last_checkpoint.lock().await;
        if last.elapsed() < self.interval {
            return Ok(false);
        }
        let metrics = self.summary().await?;
        self.publisher.push_metrics(&metrics).await?;
        *last = Instant::now();
        info!("telemetry checkpoint pushed");
        Ok(true)
    }
}
