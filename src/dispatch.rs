//! Detached task execution.
//!
//! Broadcasts triggered by requests are submitted here instead of being
//! awaited.  Tasks run on a fixed pool of workers in no particular order,
//! cannot be cancelled once queued, and are dropped with a warning when the
//! queue is full; the next forced sync covers whatever was lost.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::{mpsc, Mutex, Notify};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<(&'static str, Task)>,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    /// Spawns `workers` tasks on the current runtime draining a queue of
    /// `capacity` entries.
    pub fn spawn(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<(&'static str, Task)>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(InFlight::default());

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((label, task)) = next else {
                        break;
                    };
                    debug!("worker {} running {}", worker, label);
                    if let Err(e) = tokio::spawn(task).await {
                        error!("{} failed: {}", label, e);
                    }
                    in_flight.finish();
                }
            });
        }

        Self { tx, in_flight }
    }

    /// Queues `task` without waiting for it.  Returns `false` when the task
    /// was dropped because the queue is full or closed.
    pub fn submit<F>(&self, label: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.in_flight.start();
        match self.tx.try_send((label, Box::pin(task))) {
            Ok(()) => true,
            Err(e) => {
                self.in_flight.finish();
                warn!("dropping {}: {}", label, e);
                false
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Waits until every queued task has completed.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}
