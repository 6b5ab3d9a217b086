use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::HostId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Gossip,
    Loopback,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_host_id: Option<HostId>,
    pub api_bind: SocketAddr,
    pub dns_bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub dns_mode: bool,
    pub message_queue: bool,
    pub failover: bool,
    pub broker: BrokerKind,
    pub topic_secret: String,
    pub bootstrap_peers: Vec<String>,
    pub publish_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub force_sync_every: u32,
    pub checkpoint_interval_secs: u64,
    pub default_ingress_dns: String,
    pub dispatch_workers: usize,
    pub dispatch_queue: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_snapshot: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: "meshsync".into(),
            server_host_id: None,
            api_bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
            dns_bind: SocketAddr::from(([0, 0, 0, 0], 53)),
            bind_ip: None,
            dns_mode: false,
            message_queue: true,
            failover: true,
            broker: BrokerKind::Loopback,
            topic_secret: "default_insecure_secret".into(),
            bootstrap_peers: Vec::new(),
            publish_timeout_secs: 20,
            sync_interval_secs: 60,
            force_sync_every: 5,
            checkpoint_interval_secs: 24 * 60 * 60,
            default_ingress_dns: "1.1.1.1".into(),
            dispatch_workers: 8,
            dispatch_queue: 1024,
            registry_snapshot: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("meshsync.toml"))
                .merge(Json::file("meshsync.json"))
                .merge(Env::prefixed("MESHSYNC_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("MESHSYNC_TOPIC_SECRET_FILE") {
            config.topic_secret = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        // If bind_ip is set, override the IP part of dns_bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.dns_bind.port();
            config.dns_bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        Ok(config)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}
