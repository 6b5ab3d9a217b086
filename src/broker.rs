//! Message broker transports.
//!
//! Every broker topic string maps to its own iroh-gossip topic: the topic id
//! is the SHA-256 of the cluster secret followed by the topic string, so
//! only hosts that know the secret can derive where their updates land.
//! Gossip keeps no retained messages and acknowledges once the message is
//! handed to the swarm.
//! [`LoopbackBroker`] keeps messages in process for single-node setups.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeId};
use iroh_gossip::net::{Gossip, GossipSender, JoinOptions, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub qos: Qos,
    pub retain: bool,
}

impl Delivery {
    pub const FIRE_AND_FORGET: Self = Self {
        qos: Qos::AtMostOnce,
        retain: false,
    };
    pub const RETAINED: Self = Self {
        qos: Qos::AtLeastOnce,
        retain: true,
    };
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Resolves once the broker accepted the message.
    async fn publish(
        &self,
        topic: &str,
        delivery: Delivery,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}

pub struct GossipBroker {
    _router: Router,
    gossip: Gossip,
    secret: String,
    bootstrap: Vec<NodeId>,
    senders: Mutex<HashMap<String, Arc<GossipSender>>>,
}

impl GossipBroker {
    pub async fn bind(secret: String, bootstrap_peers: &[String]) -> anyhow::Result<Self> {
        let endpoint = Endpoint::builder().discovery_n0().bind().await?;
        info!("Gossip endpoint created with ID: {}", endpoint.node_id());

        let my_addr = endpoint.node_addr().await?;
        let gossip = Gossip::from_endpoint(
            endpoint.clone(),
            iroh_gossip::proto::Config::default(),
            &my_addr.info,
        );
        let router = Router::builder(endpoint)
            .accept(GOSSIP_ALPN, Arc::new(gossip.clone()))
            .spawn()
            .await?;

        Ok(Self {
            _router: router,
            gossip,
            secret,
            bootstrap: bootstrap_ids(bootstrap_peers),
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Joins the gossip topic for `topic` on first use.  The join does not
    /// wait for neighbours; broadcasts queue until one connects.
    async fn sender(&self, topic: &str) -> Result<Arc<GossipSender>, TransportError> {
        let mut senders = self.senders.lock().await;
        if let Some(sender) = senders.get(topic) {
            return Ok(Arc::clone(sender));
        }

        let topic_id = topic_id(&self.secret, topic);
        let (sender, mut receiver) = self
            .gossip
            .join_with_opts(topic_id, JoinOptions::with_bootstrap(self.bootstrap.clone()))
            .split();
        debug!("Joined gossip topic {} for {}", hex::encode(topic_id.as_bytes()), topic);

        let name = topic.to_string();
        tokio::spawn(async move {
            while let Some(event) = receiver.next().await {
                match event {
                    Ok(event) => debug!("Gossip event on {}: {:?}", name, event),
                    Err(e) => {
                        warn!("Gossip receiver for {} closed: {}", name, e);
                        break;
                    }
                }
            }
        });

        let sender = Arc::new(sender);
        senders.insert(topic.to_string(), Arc::clone(&sender));
        Ok(sender)
    }
}

fn bootstrap_ids(peers: &[String]) -> Vec<NodeId> {
    let mut ids = Vec::new();
    for peer in peers {
        match peer.parse::<NodeId>() {
            Ok(id) => ids.push(id),
            Err(_) => warn!("Invalid bootstrap peer ID: {}", peer),
        }
    }
    ids
}

#[async_trait]
impl Broker for GossipBroker {
    async fn publish(
        &self,
        topic: &str,
        delivery: Delivery,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if delivery.retain {
            debug!("gossip has no retention, {} is delivered to current subscribers only", topic);
        }
        let sender = self.sender(topic).await?;
        sender
            .broadcast(payload.into())
            .await
            .map_err(|e| TransportError::Broker {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

pub fn topic_id(secret: &str, topic: &str) -> TopicId {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(topic.as_bytes());
    TopicId::from_bytes(hasher.finalize().into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub delivery: Delivery,
    pub payload: Vec<u8>,
}

/// In-process broker that records what was published.
#[derive(Debug, Default)]
pub struct LoopbackBroker {
    published: Mutex<Vec<Published>>,
}

impl LoopbackBroker {
    pub async fn published(&self) -> Vec<Published> {
        self.published.lock().await.clone()
    }

    pub async fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Broker for LoopbackBroker {
    async fn publish(
        &self,
        topic: &str,
        delivery: Delivery,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        debug!("loopback publish to {} ({} bytes)", topic, payload.len());
        self.published.lock().await.push(Published {
            topic: topic.to_string(),
            delivery,
            payload,
        });
        Ok(())
    }
}
