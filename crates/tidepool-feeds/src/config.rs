//! Engine and per-feed configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::{AcceptAll, AcceptPolicy, FeedKind};

/// Default cap on queued items for timelines.
pub const DEFAULT_MAX_QUEUED_TIMELINE: usize = 40;

/// Default cap on queued notifications.
pub const DEFAULT_MAX_QUEUED_NOTIFICATIONS: usize = 40;

/// Default page size requested from the pager.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queue cap for timeline feeds.
    pub max_queued_timeline: usize,
    /// Queue cap for the notifications feed.
    pub max_queued_notifications: usize,
    /// Queue cap for chat message lists.
    pub max_queued_chat: usize,
    /// Page size requested per pull.
    pub page_limit: u32,
    /// Auto-flush interval for feeds scrolled to the top. `None` disables
    /// the ticker; flushes then only happen on request.
    pub dequeue_interval_secs: Option<u64>,
    /// Streaming endpoint. When unset it is derived from the server URL.
    pub streaming_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queued_timeline: DEFAULT_MAX_QUEUED_TIMELINE,
            max_queued_notifications: DEFAULT_MAX_QUEUED_NOTIFICATIONS,
            max_queued_chat: DEFAULT_MAX_QUEUED_TIMELINE,
            page_limit: DEFAULT_PAGE_LIMIT,
            dequeue_interval_secs: None,
            streaming_url: None,
        }
    }
}

impl EngineConfig {
    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    pub fn with_max_queued_timeline(mut self, max: usize) -> Self {
        self.max_queued_timeline = max;
        self
    }

    pub fn with_dequeue_interval(mut self, interval: Duration) -> Self {
        self.dequeue_interval_secs = Some(interval.as_secs().max(1));
        self
    }

    pub fn with_streaming_url(mut self, url: impl Into<String>) -> Self {
        self.streaming_url = Some(url.into());
        self
    }

    /// Streaming endpoint for a server, honoring an explicit override.
    pub fn streaming_url_for(&self, server_url: &str) -> String {
        if let Some(url) = &self.streaming_url {
            return url.clone();
        }
        let base = server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/api/v1/streaming", base)
    }

    pub fn max_queued_for(&self, kind: FeedKind) -> usize {
        match kind {
            FeedKind::Timeline => self.max_queued_timeline,
            FeedKind::Notifications => self.max_queued_notifications,
            FeedKind::Chat => self.max_queued_chat,
        }
    }

    pub fn dequeue_interval(&self) -> Option<Duration> {
        self.dequeue_interval_secs.map(Duration::from_secs)
    }

    /// Default configuration for a new feed of the given kind.
    pub fn feed_config(&self, kind: FeedKind) -> FeedConfig {
        FeedConfig::default().with_max_queued(self.max_queued_for(kind))
    }
}

/// Settings for one feed.
#[derive(Clone)]
pub struct FeedConfig {
    pub max_queued: usize,
    pub policy: Arc<dyn AcceptPolicy>,
    /// Initial value of the "scrolled to newest" hint.
    pub is_at_top: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_queued: DEFAULT_MAX_QUEUED_TIMELINE,
            policy: Arc::new(AcceptAll),
            is_at_top: true,
        }
    }
}

impl std::fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConfig")
            .field("max_queued", &self.max_queued)
            .field("is_at_top", &self.is_at_top)
            .finish_non_exhaustive()
    }
}

impl FeedConfig {
    pub fn with_max_queued(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    pub fn with_policy(mut self, policy: impl AcceptPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_shared_policy(mut self, policy: Arc<dyn AcceptPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn at_top(mut self, at_top: bool) -> Self {
        self.is_at_top = at_top;
        self
    }
}
