//! meshsync daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;

mod api;
mod broadcast;
mod broker;
mod config;
mod deletion;
mod dispatch;
mod dns;
mod dns_server;
mod error;
mod gateway;
mod maintenance;
mod peers;
mod publisher;
mod registry;
mod scheduler;
#[cfg(test)]
mod testing;
mod types;

use api::ApiState;
use broadcast::Broadcaster;
use broker::{Broker, GossipBroker, LoopbackBroker};
use config::{BrokerKind, Config};
use deletion::DeletionCoordinator;
use dispatch::Dispatcher;
use dns::{DnsService, DnsZone};
use dns_server::run_dns_server;
use gateway::{EgressValidator, GatewayManager};
use maintenance::ServerMaintenance;
use peers::PeerView;
use publisher::Publisher;
use registry::{MemoryRegistry, NodeLocks, Registry};
use scheduler::SyncScheduler;

/// How long shutdown waits for detached broadcasts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;
    info!(
        "Starting meshsync server {} (broker: {:?}, dns mode: {}, message queue: {})",
        cfg.server_id, cfg.broker, cfg.dns_mode, cfg.message_queue
    );

    // Registry
    let registry: Arc<dyn Registry> = match &cfg.registry_snapshot {
        Some(path) => Arc::new(MemoryRegistry::from_snapshot_file(path)?),
        None => Arc::new(MemoryRegistry::default()),
    };

    // Broker and publishing
    let broker: Arc<dyn Broker> = match cfg.broker {
        BrokerKind::Gossip => {
            Arc::new(GossipBroker::bind(cfg.topic_secret.clone(), &cfg.bootstrap_peers).await?)
        }
        BrokerKind::Loopback => Arc::new(LoopbackBroker::default()),
    };
    let publisher = Arc::new(Publisher::new(
        broker,
        cfg.server_id.clone(),
        cfg.publish_timeout(),
    ));

    let dns = DnsService::new(Arc::clone(&registry), DnsZone::default());
    let peers = PeerView::new(
        cfg.server_id.clone(),
        Arc::clone(&registry),
        cfg.dns_mode.then(|| dns.aggregator().clone()),
    );
    let broadcaster = Arc::new(Broadcaster::new(
        Arc::clone(&registry),
        Arc::clone(&publisher),
        peers,
        cfg.message_queue,
    ));
    let dispatcher = Dispatcher::spawn(cfg.dispatch_workers, cfg.dispatch_queue);
    let locks = Arc::new(NodeLocks::default());

    let gateways = Arc::new(
        GatewayManager::new(
            Arc::clone(&registry),
            Arc::new(EgressValidator::new(Arc::clone(&registry))),
            Arc::clone(&broadcaster),
            dispatcher.clone(),
            Arc::clone(&locks),
        )
        .with_failover(cfg.failover)
        .with_default_ingress_dns(cfg.default_ingress_dns.clone()),
    );
    let deletion = Arc::new(DeletionCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&broadcaster),
        cfg.dns_mode.then(|| dns.clone()),
        dispatcher.clone(),
        locks,
    ));

    // Sync scheduler
    let maintenance = Arc::new(ServerMaintenance::new(
        Arc::clone(&registry),
        Arc::clone(&publisher),
        cfg.server_host_id,
        cfg.checkpoint_interval(),
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        Arc::clone(&broadcaster),
        maintenance,
        cfg.force_sync_every,
    ));
    let scheduler_handle = tokio::spawn(scheduler.run(cfg.sync_interval()));

    // DNS Server
    let dns_handle = if cfg.dns_mode {
        if let Err(e) = dns.refresh_all().await {
            error!("Initial DNS refresh failed: {}", e);
        }
        let zone = dns.zone().clone();
        let dns_bind = cfg.dns_bind;
        Some(tokio::spawn(async move {
            if let Err(e) = run_dns_server(dns_bind, zone).await {
                error!("DNS server failed: {}", e);
            }
        }))
    } else {
        None
    };

    // HTTP API
    let state = ApiState { gateways, deletion };
    let api_bind = cfg.api_bind;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_bind, state).await {
            error!("API server failed: {}", e);
        }
    });

    let start = Arc::clone(&broadcaster);
    dispatcher.submit("server start notify", async move {
        if let Err(e) = start.server_start_notify().await {
            error!("Server start notification failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    scheduler_handle.abort();
    api_handle.abort();
    if let Some(handle) = dns_handle {
        handle.abort();
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, dispatcher.wait_idle())
        .await
        .is_err()
    {
        warn!(
            "Shutting down with {} broadcasts still in flight",
            dispatcher.in_flight()
        );
    }

    info!("Shutdown complete.");
    Ok(())
}
