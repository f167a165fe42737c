//! Routing of push events to the feeds subscribed on their topic.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::stream::PushEvent;
use crate::{EntityCache, FeedId, FeedKind, FeedRegistry, ItemRef, PushOutcome, StreamTopic};

/// Outcome of routing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Pushed into feeds; one outcome per target feed.
    Pushed(Vec<(FeedId, PushOutcome)>),
    /// Removed from this many feeds.
    Deleted(usize),
    /// Only the entity cache was touched.
    CacheOnly,
    Ignored,
}

/// Maps stream topics to feeds and applies events to them.
pub struct EventRouter {
    registry: Arc<FeedRegistry>,
    cache: Arc<dyn EntityCache>,
    subscriptions: DashMap<StreamTopic, HashSet<FeedId>>,
}

impl EventRouter {
    pub fn new(registry: Arc<FeedRegistry>, cache: Arc<dyn EntityCache>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            subscriptions: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<FeedRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<dyn EntityCache> {
        &self.cache
    }

    /// Attach a feed to a topic. Returns true if the topic had no feeds
    /// before, i.e. the transport needs a new subscription.
    pub fn add_subscription(&self, topic: StreamTopic, feed: FeedId) -> bool {
        let mut feeds = self.subscriptions.entry(topic).or_default();
        let newly_needed = feeds.is_empty();
        feeds.insert(feed);
        newly_needed
    }

    /// Detach a feed from a topic. Returns true if no feed needs the topic
    /// any more.
    pub fn remove_subscription(&self, topic: &StreamTopic, feed: &FeedId) -> bool {
        let no_longer_needed = match self.subscriptions.get_mut(topic) {
            Some(mut feeds) => feeds.remove(feed) && feeds.is_empty(),
            None => false,
        };
        if no_longer_needed {
            self.subscriptions.remove(topic);
        }
        no_longer_needed
    }

    /// Feeds currently attached to a topic.
    pub fn feeds_for(&self, topic: &StreamTopic) -> Vec<FeedId> {
        self.subscriptions
            .get(topic)
            .map(|feeds| feeds.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Topics with at least one attached feed.
    pub fn topics(&self) -> Vec<StreamTopic> {
        self.subscriptions
            .iter()
            .filter(|r| !r.value().is_empty())
            .map(|r| r.key().clone())
            .collect()
    }

    /// Apply an event received on `topic`.
    pub async fn route(&self, topic: &StreamTopic, event: PushEvent) -> Routed {
        match event {
            PushEvent::Update(item) => {
                self.cache.upsert(item.clone());
                self.push_to_kind(topic, FeedKind::Timeline, &item).await
            }
            PushEvent::Notification(item) => {
                self.cache.upsert(item.clone());
                self.push_to_kind(topic, FeedKind::Notifications, &item).await
            }
            PushEvent::StatusUpdate(item) => {
                trace!(id = %item.id, "status edited, refreshing cache");
                self.cache.upsert(item);
                Routed::CacheOnly
            }
            PushEvent::Delete(id) => {
                let mut ids = self.cache.reblogs_of(&id);
                ids.push(id);
                for id in &ids {
                    self.cache.remove(id);
                }
                let touched = self.registry.delete_everywhere(&ids).await;
                debug!(topic = %topic, ids = ?ids, touched, "status deleted");
                Routed::Deleted(touched)
            }
            PushEvent::ChatMessageCreated { chat_id, item } => {
                self.cache.upsert(item.clone());
                let feed = FeedId::Chat { id: chat_id };
                let outcome = self.registry.push_item(&feed, &item).await;
                trace!(feed = %feed, id = %item.id, ?outcome, "chat message routed");
                Routed::Pushed(vec![(feed, outcome)])
            }
            PushEvent::ChatMessageDeleted(id) => {
                self.cache.remove(&id);
                let touched = self.registry.delete_everywhere(std::slice::from_ref(&id)).await;
                Routed::Deleted(touched)
            }
            PushEvent::Ignored(kind) => {
                debug!(topic = %topic, event = %kind, "ignoring stream event");
                Routed::Ignored
            }
        }
    }

    async fn push_to_kind(&self, topic: &StreamTopic, kind: FeedKind, item: &ItemRef) -> Routed {
        let mut outcomes = Vec::new();
        for feed in self.feeds_for(topic) {
            if feed.kind() != kind {
                continue;
            }
            let outcome = self.registry.push_item(&feed, item).await;
            trace!(feed = %feed, id = %item.id, ?outcome, "push routed");
            outcomes.push((feed, outcome));
        }
        Routed::Pushed(outcomes)
    }
}
