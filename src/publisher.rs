//! Serializes payloads onto deterministic broker topics.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::Serialize;

use crate::broker::{Broker, Delivery};
use crate::error::{Result, TransportError};
use crate::types::{Host, HostId, Metrics, NodeId};

pub const METRICS_TOPIC: &str = "metrics_exporter";

pub fn peers_topic(host_id: HostId, server_id: &str) -> String {
    format!("peers/host/{}/{}", host_id, server_id)
}

pub fn node_update_topic(network: &str, node_id: NodeId) -> String {
    format!("node/update/{}/{}", network, node_id)
}

pub fn host_update_topic(host_id: HostId, server_id: &str) -> String {
    format!("host/update/{}/{}", host_id, server_id)
}

/// Publishes with a bounded wait for the broker acknowledgement.  Failures
/// are returned for the caller to log; nothing is retried here.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    server_id: String,
    timeout: Duration,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, server_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            broker,
            server_id: server_id.into(),
            timeout,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub async fn publish<T>(&self, host: &Host, topic: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let data = serde_json::to_vec(payload)?;
        debug!("publishing {} bytes to {} for host {}", data.len(), topic, host.id);
        self.send(topic, Delivery::FIRE_AND_FORGET, data).await
    }

    pub async fn push_metrics(&self, metrics: &Metrics) -> Result<()> {
        debug!("pushing metrics to exporter");
        let data = serde_json::to_vec(metrics)?;
        self.send(METRICS_TOPIC, Delivery::RETAINED, data).await
    }

    async fn send(&self, topic: &str, delivery: Delivery, data: Vec<u8>) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.broker.publish(topic, delivery, data)).await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout {
                topic: topic.to_string(),
                timeout: self.timeout,
            }
            .into()),
        }
    }
}
