//! Registry of live feeds.
//!
//! Maps each [`FeedId`] to its own lockable [`Feed`]. There is no lock over
//! the whole registry: operations on different feeds never contend, and all
//! mutations of one feed are serialized by that feed's mutex.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, trace, warn};

use crate::feed::{DequeueStep, Feed, FeedSnapshot, PullApplied, PullTicket, PushOutcome};
use crate::{
    EngineConfig, EntityCache, FeedConfig, FeedError, FeedId, ItemRef, PendingLocalItems, PullDirection,
    PullError, PullPage,
};

/// Broadcast channel capacity for feed updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

/// Change notification for feed subscribers (e.g. a renderer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUpdate {
    /// Visible items changed (push insert, pull merge, flush, delete).
    ItemsChanged { feed: FeedId },
    /// An item was added to (or counted against) the pending queue.
    Queued { feed: FeedId, total_queued: usize },
    /// The feed was rebuilt from a fresh pull after a queue overflow.
    Resynced { feed: FeedId, items: usize },
    /// The feed was cleared.
    Cleared { feed: FeedId },
    /// A pull started or ended.
    LoadingChanged { feed: FeedId, loading: bool },
    /// The push subscription opened or closed.
    ConnectionChanged { feed: FeedId, connected: bool },
}

/// Result of a dequeue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutcome {
    Noop,
    /// Queued items were moved into the visible set.
    Flushed(usize),
    /// The queue had overflowed; the feed was rebuilt from a fresh pull.
    Resynced(usize),
    /// The queue had overflowed, but the feed was cleared again before the
    /// resync page arrived; the page was dropped.
    Abandoned,
}

/// Registry of feeds keyed by id.
pub struct FeedRegistry {
    feeds: DashMap<FeedId, Arc<Mutex<Feed>>>,
    config: EngineConfig,
    pending_local: Arc<PendingLocalItems>,
    updates_tx: broadcast::Sender<FeedUpdate>,
}

impl FeedRegistry {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_pending(config, Arc::new(PendingLocalItems::new()))
    }

    /// Create a registry sharing an existing set of pending local items.
    pub fn with_pending(config: EngineConfig, pending_local: Arc<PendingLocalItems>) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            feeds: DashMap::new(),
            config,
            pending_local,
            updates_tx,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pending_local(&self) -> &Arc<PendingLocalItems> {
        &self.pending_local
    }

    /// Subscribe to feed change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates_tx.subscribe()
    }

    fn broadcast(&self, update: FeedUpdate) {
        // No receivers is fine.
        let _ = self.updates_tx.send(update);
    }

    /// Get a feed, creating it with the default config for its kind.
    pub fn feed(&self, id: &FeedId) -> Arc<Mutex<Feed>> {
        if let Some(feed) = self.feeds.get(id) {
            return Arc::clone(feed.value());
        }
        let entry = self.feeds.entry(id.clone()).or_insert_with(|| {
            debug!(feed = %id, "creating feed");
            let config = self.config.feed_config(id.kind());
            Arc::new(Mutex::new(Feed::new(id.clone(), config)))
        });
        Arc::clone(entry.value())
    }

    /// Apply a config to a feed, creating it if needed.
    pub async fn configure(&self, id: &FeedId, config: FeedConfig) {
        let feed = self.feed(id);
        feed.lock().await.reconfigure(config);
    }

    pub fn contains(&self, id: &FeedId) -> bool {
        self.feeds.contains_key(id)
    }

    pub fn feed_ids(&self) -> Vec<FeedId> {
        self.feeds.iter().map(|r| r.key().clone()).collect()
    }

    /// Drop a feed's state entirely (e.g. on logout).
    pub fn remove(&self, id: &FeedId) -> bool {
        self.feeds.remove(id).is_some()
    }

    pub async fn snapshot(&self, id: &FeedId) -> Option<FeedSnapshot> {
        let feed = self.feeds.get(id).map(|r| Arc::clone(r.value()))?;
        let snapshot = feed.lock().await.snapshot();
        Some(snapshot)
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Mark a feed connected. Returns true if it was not connected before.
    pub async fn connect(&self, id: &FeedId) -> bool {
        let changed = self.feed(id).lock().await.connect();
        if changed {
            info!(feed = %id, "feed connected");
            self.broadcast(FeedUpdate::ConnectionChanged {
                feed: id.clone(),
                connected: true,
            });
        }
        changed
    }

    /// Mark a feed disconnected. Existing items are kept.
    pub async fn disconnect(&self, id: &FeedId) -> bool {
        let Some(feed) = self.feeds.get(id).map(|r| Arc::clone(r.value())) else {
            return false;
        };
        let changed = feed.lock().await.disconnect();
        if changed {
            info!(feed = %id, "feed disconnected");
            self.broadcast(FeedUpdate::ConnectionChanged {
                feed: id.clone(),
                connected: false,
            });
        }
        changed
    }

    pub async fn is_connected(&self, id: &FeedId) -> bool {
        match self.feeds.get(id).map(|r| Arc::clone(r.value())) {
            Some(feed) => feed.lock().await.is_connected(),
            None => false,
        }
    }

    pub async fn set_at_top(&self, id: &FeedId, at_top: bool) {
        self.feed(id).lock().await.set_at_top(at_top);
        trace!(feed = %id, at_top, "scroll position updated");
    }

    // =========================================================================
    // Pull cycle
    // =========================================================================

    /// Start a pull. Returns `None` if the feed already has one in flight.
    pub async fn begin_pull(&self, id: &FeedId, direction: PullDirection) -> Option<PullTicket> {
        let ticket = self.feed(id).lock().await.begin_pull(direction);
        if ticket.is_some() {
            self.broadcast(FeedUpdate::LoadingChanged {
                feed: id.clone(),
                loading: true,
            });
        }
        ticket
    }

    /// Merge a completed page. Applied even if the feed was disconnected
    /// while the pull was in flight.
    pub async fn complete_pull(
        &self,
        id: &FeedId,
        ticket: PullTicket,
        page: &PullPage,
    ) -> PullApplied {
        let applied = self.feed(id).lock().await.complete_pull(ticket, page);
        if let PullApplied::Merged { added } = applied {
            self.broadcast(FeedUpdate::LoadingChanged {
                feed: id.clone(),
                loading: false,
            });
            if added > 0 {
                self.broadcast(FeedUpdate::ItemsChanged { feed: id.clone() });
            }
        }
        applied
    }

    /// End a failed pull; feed items and cursors are untouched.
    pub async fn fail_pull(&self, id: &FeedId, ticket: PullTicket, error: &PullError) {
        warn!(feed = %id, direction = ?ticket.direction, error = %error, "pull failed");
        if self.feed(id).lock().await.fail_pull(ticket) {
            self.broadcast(FeedUpdate::LoadingChanged {
                feed: id.clone(),
                loading: false,
            });
        }
    }

    // =========================================================================
    // Push ingestion
    // =========================================================================

    /// Deliver a pushed item to a feed.
    ///
    /// Feeds that do not exist or are not connected do not receive pushes.
    pub async fn push_item(&self, id: &FeedId, item: &ItemRef) -> PushOutcome {
        let Some(feed) = self.feeds.get(id).map(|r| Arc::clone(r.value())) else {
            return PushOutcome::NotConnected;
        };
        let mut feed = feed.lock().await;
        if !feed.is_connected() {
            return PushOutcome::NotConnected;
        }

        let outcome = feed.push_item(item, &self.pending_local);
        match outcome {
            PushOutcome::Inserted => {
                self.broadcast(FeedUpdate::ItemsChanged { feed: id.clone() });
            }
            PushOutcome::Queued | PushOutcome::QueueFull => {
                self.broadcast(FeedUpdate::Queued {
                    feed: id.clone(),
                    total_queued: feed.total_queued(),
                });
            }
            PushOutcome::Duplicate
            | PushOutcome::Rejected
            | PushOutcome::SuppressedOwn
            | PushOutcome::NotConnected => {}
        }
        outcome
    }

    // =========================================================================
    // Dequeue
    // =========================================================================

    /// Flush a feed's pending queue, or resync it if the queue overflowed.
    ///
    /// On overflow the feed is cleared and `resync` is awaited for a fresh
    /// newest page, which then becomes the feed's entire content. The feed
    /// lock is not held while `resync` runs.
    pub async fn dequeue<F, Fut>(&self, id: &FeedId, resync: F) -> Result<DequeueOutcome, FeedError>
    where
        F: FnOnce(FeedId) -> Fut,
        Fut: Future<Output = Result<PullPage, PullError>>,
    {
        let Some(feed) = self.feeds.get(id).map(|r| Arc::clone(r.value())) else {
            return Ok(DequeueOutcome::Noop);
        };

        let step = feed.lock().await.dequeue();
        let ticket = match step {
            DequeueStep::Noop => return Ok(DequeueOutcome::Noop),
            DequeueStep::Flushed(count) => {
                self.broadcast(FeedUpdate::ItemsChanged { feed: id.clone() });
                return Ok(DequeueOutcome::Flushed(count));
            }
            DequeueStep::Resync(ticket) => ticket,
        };

        info!(feed = %id, "pending queue overflowed, resyncing feed");
        self.broadcast(FeedUpdate::Cleared { feed: id.clone() });
        self.broadcast(FeedUpdate::LoadingChanged {
            feed: id.clone(),
            loading: true,
        });

        match resync(id.clone()).await {
            Ok(page) => {
                let count = page.items.len();
                match self.complete_pull(id, ticket, &page).await {
                    PullApplied::Merged { .. } => {
                        self.broadcast(FeedUpdate::Resynced {
                            feed: id.clone(),
                            items: count,
                        });
                        Ok(DequeueOutcome::Resynced(count))
                    }
                    PullApplied::Stale => {
                        debug!(feed = %id, "resync page arrived after the feed was cleared");
                        Ok(DequeueOutcome::Abandoned)
                    }
                }
            }
            Err(e) => {
                self.fail_pull(id, ticket, &e).await;
                Err(FeedError::PullFailed(e))
            }
        }
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Reset a feed's items, queue and cursors; its connection is kept.
    pub async fn clear(&self, id: &FeedId) {
        if let Some(feed) = self.feeds.get(id).map(|r| Arc::clone(r.value())) {
            feed.lock().await.clear();
            debug!(feed = %id, "feed cleared");
            self.broadcast(FeedUpdate::Cleared { feed: id.clone() });
        }
    }

    /// Remove an item from one feed.
    pub async fn delete_item(&self, id: &FeedId, item_id: &str) -> bool {
        let Some(feed) = self.feeds.get(id).map(|r| Arc::clone(r.value())) else {
            return false;
        };
        let removed = feed.lock().await.delete_item(item_id);
        if removed {
            self.broadcast(FeedUpdate::ItemsChanged { feed: id.clone() });
        }
        removed
    }

    /// Remove items from every feed. Returns the number of feeds touched.
    pub async fn delete_everywhere(&self, item_ids: &[String]) -> usize {
        self.remove_where_everywhere(|id| item_ids.iter().any(|d| d == id))
            .await
    }

    /// Remove matching items from every feed. Returns the number of feeds touched.
    pub async fn remove_where_everywhere(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let feeds: Vec<(FeedId, Arc<Mutex<Feed>>)> = self
            .feeds
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        let mut touched = 0;
        for (id, feed) in feeds {
            let removed = feed.lock().await.remove_where(&predicate);
            if removed > 0 {
                touched += 1;
                trace!(feed = %id, removed, "items removed");
                self.broadcast(FeedUpdate::ItemsChanged { feed: id });
            }
        }
        touched
    }

    /// Remove every item authored by an account (block or mute).
    ///
    /// Authorship is looked up in the entity cache; uncached ids are kept.
    pub async fn purge_account(&self, account_id: &str, cache: &dyn EntityCache) -> usize {
        let touched = self
            .remove_where_everywhere(|id| {
                cache
                    .get(id)
                    .is_some_and(|item| item.account_id == account_id)
            })
            .await;
        info!(account = %account_id, touched, "purged account from feeds");
        touched
    }

    /// Insert a freshly confirmed local item at the front of a feed.
    pub async fn prepend_confirmed(&self, id: &FeedId, item_id: &str) -> bool {
        let inserted = self.feed(id).lock().await.prepend_confirmed(item_id);
        if inserted {
            self.broadcast(FeedUpdate::ItemsChanged { feed: id.clone() });
        }
        inserted
    }
}
