//! Periodic peer resynchronization.
//!
//! Most ticks do nothing.  Every `force_every`-th tick refreshes the server
//! host, runs the maintenance checkpoint and sends every host a full peer
//! view, which repairs whatever a dropped detached broadcast left stale.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::MissedTickBehavior;

use crate::broadcast::{Broadcaster, FanoutSummary};
use crate::maintenance::Maintenance;

pub const DEFAULT_FORCE_EVERY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Ticks counted since the last forced sync.
    Idle(u32),
    /// A forced sync ran; `None` when the hosts could not be listed.
    Forced(Option<FanoutSummary>),
}

pub struct SyncScheduler {
    counter: AtomicU32,
    force_every: u32,
    broadcaster: Arc<Broadcaster>,
    maintenance: Arc<dyn Maintenance>,
}

impl SyncScheduler {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        maintenance: Arc<dyn Maintenance>,
        force_every: u32,
    ) -> Self {
        Self {
            counter: AtomicU32::new(0),
            force_every: force_every.max(1),
            broadcaster,
            maintenance,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.force_every {
            debug!("sync tick {}/{}", count, self.force_every);
            return TickOutcome::Idle(count);
        }
        self.counter.store(0, Ordering::SeqCst);

        if let Err(e) = self.maintenance.refresh_server_host().await {
            error!("error refreshing server host: {}", e);
        }
        if let Err(e) = self.maintenance.checkpoint().await {
            error!("error occurred on timer checkpoint: {}", e);
        }

        info!("sending scheduled peer update");
        match self.broadcaster.publish_peer_update().await {
            Ok(summary) => TickOutcome::Forced(Some(summary)),
            Err(e) => {
                error!("scheduled peer update failed: {}", e);
                TickOutcome::Forced(None)
            }
        }
    }

    /// Ticks every `period` until the task is aborted.  A tick that runs
    /// long delays the next one instead of overlapping it.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}
