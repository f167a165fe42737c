//! Feed sync: drives pulls and push subscriptions for the registry.
//!
//! Combines the registry with a [`CursorPager`] and the [`EventRouter`]:
//! - `refresh` pulls items newer than the head of a feed
//! - `expand` backfills items older than its tail
//! - `dequeue` flushes the pending queue, resyncing through the pager on overflow
//!
//! Pulls run with no feed lock held; the registry brackets each one with a
//! ticket so a feed never has two in flight.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::pager::{CursorPager, PullRequest};
use crate::router::EventRouter;
use crate::stream::StreamHandle;
use crate::{
    DEFAULT_PAGE_LIMIT, DequeueOutcome, EngineConfig, EntityCache, FeedError, FeedId,
    FeedRegistry, ItemRef, MemoryEntityCache, PullApplied, PullDirection, PullError, PullPage,
    PullTicket,
};

/// Coordinates pulls and subscriptions for all feeds.
pub struct FeedSync {
    registry: Arc<FeedRegistry>,
    cache: Arc<dyn EntityCache>,
    pager: Arc<dyn CursorPager>,
    router: Arc<EventRouter>,
    stream: Option<StreamHandle>,
    page_limit: u32,
}

impl FeedSync {
    pub fn new(pager: Arc<dyn CursorPager>, router: Arc<EventRouter>) -> Self {
        let registry = Arc::clone(router.registry());
        let page_limit = registry.config().page_limit;
        Self {
            cache: Arc::clone(router.cache()),
            registry,
            pager,
            router,
            stream: None,
            page_limit,
        }
    }

    /// Forward subscription changes to a running streaming client.
    pub fn with_stream(mut self, stream: StreamHandle) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    pub fn registry(&self) -> Arc<FeedRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn router(&self) -> Arc<EventRouter> {
        Arc::clone(&self.router)
    }

    pub fn cache(&self) -> Arc<dyn EntityCache> {
        Arc::clone(&self.cache)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Open a feed's push subscription. Idempotent.
    #[tracing::instrument(skip(self), fields(feed = %id))]
    pub async fn connect(&self, id: &FeedId) -> bool {
        let changed = self.registry.connect(id).await;
        if let Some(topic) = id.stream_topic()
            && self.router.add_subscription(topic.clone(), id.clone())
        {
            match &self.stream {
                Some(stream) => {
                    if !stream.subscribe(topic.clone()) {
                        warn!(topic = %topic, "streaming client stopped, subscription not sent");
                    }
                }
                None => debug!(topic = %topic, "no streaming client, topic recorded only"),
            }
        }
        changed
    }

    /// Close a feed's push subscription. Items are kept.
    #[tracing::instrument(skip(self), fields(feed = %id))]
    pub async fn disconnect(&self, id: &FeedId) -> bool {
        let changed = self.registry.disconnect(id).await;
        if let Some(topic) = id.stream_topic()
            && self.router.remove_subscription(&topic, id)
            && let Some(stream) = &self.stream
        {
            stream.unsubscribe(topic);
        }
        changed
    }

    // =========================================================================
    // Pulls
    // =========================================================================

    /// Pull items newer than the head of a feed. On an unloaded feed this is
    /// the initial load.
    ///
    /// Returns `Ok(None)` if the feed already has a pull in flight.
    #[tracing::instrument(skip(self), fields(feed = %id))]
    pub async fn refresh(&self, id: &FeedId) -> Result<Option<PullApplied>, FeedError> {
        let Some(ticket) = self.registry.begin_pull(id, PullDirection::Newer).await else {
            debug!("pull already in flight");
            return Ok(None);
        };

        let request = match self.registry.snapshot(id).await {
            Some(snapshot) if snapshot.loaded => match (snapshot.prev_cursor, snapshot.items.first()) {
                (Some(cursor), _) => PullRequest::from_cursor(cursor),
                (None, Some(head)) => PullRequest {
                    since_id: Some(head.clone()),
                    limit: Some(self.page_limit),
                    ..PullRequest::default()
                },
                (None, None) => PullRequest::newest(self.page_limit),
            },
            _ => PullRequest::newest(self.page_limit),
        };

        self.run_pull(id, ticket, &request).await.map(Some)
    }

    /// Backfill items older than the tail of a feed.
    ///
    /// Returns `Ok(None)` if a pull is in flight or the feed has nothing more
    /// to load.
    #[tracing::instrument(skip(self), fields(feed = %id))]
    pub async fn expand(&self, id: &FeedId) -> Result<Option<PullApplied>, FeedError> {
        if let Some(snapshot) = self.registry.snapshot(id).await
            && snapshot.loaded
            && !snapshot.backfill.has_more()
        {
            debug!("backfill exhausted");
            return Ok(None);
        }

        let Some(ticket) = self.registry.begin_pull(id, PullDirection::Older).await else {
            debug!("pull already in flight");
            return Ok(None);
        };

        let request = match self.registry.snapshot(id).await {
            Some(snapshot) if snapshot.loaded => match (snapshot.next_cursor, snapshot.items.last()) {
                (Some(cursor), _) => PullRequest::from_cursor(cursor),
                // Partial page without a cursor: continue below the tail.
                (None, Some(tail)) => PullRequest {
                    max_id: Some(tail.clone()),
                    limit: Some(self.page_limit),
                    ..PullRequest::default()
                },
                (None, None) => PullRequest::newest(self.page_limit),
            },
            _ => PullRequest::newest(self.page_limit),
        };

        self.run_pull(id, ticket, &request).await.map(Some)
    }

    async fn run_pull(
        &self,
        id: &FeedId,
        ticket: PullTicket,
        request: &PullRequest,
    ) -> Result<PullApplied, FeedError> {
        match self.pager.pull(id, request).await {
            Ok(page) => {
                self.cache.upsert_all(&page.items);
                let applied = self.registry.complete_pull(id, ticket, &page).await;
                debug!(
                    direction = ?ticket.direction,
                    count = page.items.len(),
                    partial = page.partial,
                    ?applied,
                    "pull completed"
                );
                Ok(applied)
            }
            Err(e) => {
                self.registry.fail_pull(id, ticket, &e).await;
                Err(FeedError::PullFailed(e))
            }
        }
    }

    /// Fetch the newest page of a feed without touching its state.
    pub async fn fetch_fresh(&self, id: &FeedId) -> Result<PullPage, PullError> {
        let page = self
            .pager
            .pull(id, &PullRequest::newest(self.page_limit))
            .await?;
        self.cache.upsert_all(&page.items);
        Ok(page)
    }

    /// Flush a feed's pending queue, resyncing from the newest page on
    /// overflow.
    #[tracing::instrument(skip(self), fields(feed = %id))]
    pub async fn dequeue(&self, id: &FeedId) -> Result<DequeueOutcome, FeedError> {
        self.registry
            .dequeue(id, |feed| async move { self.fetch_fresh(&feed).await })
            .await
    }

    /// Refresh every connected feed, e.g. after the stream reconnects.
    pub async fn refresh_connected(&self) -> usize {
        let mut refreshed = 0;
        for id in self.registry.feed_ids() {
            if !self.registry.is_connected(&id).await {
                continue;
            }
            match self.refresh(&id).await {
                Ok(Some(_)) => refreshed += 1,
                Ok(None) => {}
                Err(e) => warn!(feed = %id, error = %e, "refresh after reconnect failed"),
            }
        }
        info!(refreshed, "connected feeds refreshed");
        refreshed
    }

    // =========================================================================
    // Local items
    // =========================================================================

    /// Register an optimistic local submission. While it is outstanding,
    /// pushed items by `account_id` are suppressed.
    pub fn begin_compose(&self, account_id: &str, key: &str) -> bool {
        self.registry.pending_local().begin(account_id, key)
    }

    /// Resolve a confirmed submission and insert the canonical item at the
    /// front of the given feeds.
    pub async fn confirm_compose(
        &self,
        account_id: &str,
        key: &str,
        item: ItemRef,
        targets: &[FeedId],
    ) -> usize {
        self.registry.pending_local().confirm(account_id, key);
        let item_id = item.id.clone();
        self.cache.upsert(item);

        let mut inserted = 0;
        for target in targets {
            if self.registry.prepend_confirmed(target, &item_id).await {
                inserted += 1;
            }
        }
        debug!(account = %account_id, id = %item_id, inserted, "local item confirmed");
        inserted
    }

    pub fn fail_compose(&self, account_id: &str, key: &str) -> bool {
        self.registry.pending_local().fail(account_id, key)
    }

    /// Remove an account's items from every feed (block or mute).
    pub async fn purge_account(&self, account_id: &str) -> usize {
        self.registry
            .purge_account(account_id, self.cache.as_ref())
            .await
    }
}

/// Builder for creating a [`FeedSync`] with optional collaborators.
pub struct FeedSyncBuilder {
    pager: Arc<dyn CursorPager>,
    config: Option<EngineConfig>,
    registry: Option<Arc<FeedRegistry>>,
    cache: Option<Arc<dyn EntityCache>>,
    router: Option<Arc<EventRouter>>,
    stream: Option<StreamHandle>,
    page_limit: Option<u32>,
}

impl FeedSyncBuilder {
    pub fn new(pager: Arc<dyn CursorPager>) -> Self {
        Self {
            pager,
            config: None,
            registry: None,
            cache: None,
            router: None,
            stream: None,
            page_limit: None,
        }
    }

    /// Engine config for a registry created by the builder.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<FeedRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use an existing router. Its registry and cache take precedence.
    pub fn router(mut self, router: Arc<EventRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn stream(mut self, stream: StreamHandle) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn page_limit(mut self, limit: u32) -> Self {
        self.page_limit = Some(limit);
        self
    }

    pub fn build(self) -> FeedSync {
        let router = match self.router {
            Some(router) => router,
            None => {
                let registry = self
                    .registry
                    .unwrap_or_else(|| FeedRegistry::new(self.config.unwrap_or_default()));
                let cache = self.cache.unwrap_or_else(|| {
                    let cache: Arc<dyn EntityCache> = MemoryEntityCache::new();
                    cache
                });
                EventRouter::new(registry, cache)
            }
        };

        let mut sync = FeedSync::new(self.pager, router);
        if let Some(stream) = self.stream {
            sync = sync.with_stream(stream);
        }
        if let Some(limit) = self.page_limit {
            sync = sync.with_page_limit(limit.clamp(1, DEFAULT_PAGE_LIMIT * 2));
        }
        sync
    }
}
