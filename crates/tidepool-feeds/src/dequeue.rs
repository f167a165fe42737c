//! Dequeue scheduler: flushes pending queues on request or on a timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{DequeueOutcome, FeedId, FeedSync};

/// Capacity of the manual flush request channel.
const REQUEST_CHANNEL_SIZE: usize = 64;

/// Cloneable handle for requesting a flush of one feed.
#[derive(Debug, Clone)]
pub struct DequeueHandle {
    requests_tx: mpsc::Sender<FeedId>,
}

impl DequeueHandle {
    /// Returns false if the scheduler has stopped.
    pub async fn request(&self, id: FeedId) -> bool {
        self.requests_tx.send(id).await.is_ok()
    }
}

/// Flushes pending queues: on manual request, and periodically for feeds
/// that are connected and scrolled to the top.
pub struct DequeueScheduler {
    sync: Arc<FeedSync>,
    interval: Option<Duration>,
    requests_rx: Mutex<mpsc::Receiver<FeedId>>,
}

impl DequeueScheduler {
    /// Create a scheduler using the registry's configured auto-flush interval.
    pub fn new(sync: Arc<FeedSync>) -> (Self, DequeueHandle) {
        let interval = sync.registry().config().dequeue_interval();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let scheduler = Self {
            sync,
            interval,
            requests_rx: Mutex::new(requests_rx),
        };
        (scheduler, DequeueHandle { requests_tx })
    }

    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "dequeue scheduler starting");

        let mut requests = self.requests_rx.lock().await;
        let mut ticker = match self.interval {
            Some(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately.
                ticker.tick().await;
                Some(ticker)
            }
            None => None,
        };

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("dequeue scheduler received shutdown signal");
                        break;
                    }
                }

                Some(id) = requests.recv() => {
                    self.flush(&id).await;
                }

                _ = next_tick(&mut ticker) => {
                    self.flush_at_top().await;
                }
            }
        }

        info!("dequeue scheduler shut down gracefully");
    }

    /// Flush one feed, logging the outcome.
    pub async fn flush(&self, id: &FeedId) -> Option<DequeueOutcome> {
        match self.sync.dequeue(id).await {
            Ok(outcome) => {
                match outcome {
                    DequeueOutcome::Noop => {}
                    DequeueOutcome::Flushed(count) => debug!(feed = %id, count, "queue flushed"),
                    DequeueOutcome::Resynced(count) => info!(feed = %id, count, "feed resynced"),
                    DequeueOutcome::Abandoned => debug!(feed = %id, "resync abandoned"),
                }
                Some(outcome)
            }
            Err(e) => {
                warn!(feed = %id, error = %e, "dequeue failed");
                None
            }
        }
    }

    /// Flush every connected feed that is at the top and has queued items.
    pub async fn flush_at_top(&self) -> usize {
        let registry = self.sync.registry();
        let mut flushed = 0;
        for id in registry.feed_ids() {
            let Some(snapshot) = registry.snapshot(&id).await else {
                continue;
            };
            if !snapshot.connected || !snapshot.is_at_top || snapshot.total_queued == 0 {
                continue;
            }
            if self.flush(&id).await.is_some() {
                flushed += 1;
            }
        }
        flushed
    }
}

/// Wait for the next auto-flush tick; never resolves when auto-flush is off.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
