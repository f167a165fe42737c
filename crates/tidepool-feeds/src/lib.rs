//! Feed synchronization engine for Tidepool.
//!
//! Keeps many live feeds (home, public, hashtag and group timelines,
//! notifications, chat message lists) consistent while three sources write
//! to them at once: the streaming push channel, paginated pulls, and
//! optimistic local posts awaiting confirmation.
//!
//! ## Features
//!
//! - **Feed**: per-feed state machine with an ordered id set, a bounded
//!   pending queue and pagination cursors
//! - **Registry**: concurrent map of independently lockable feeds
//! - **Pager**: cursor-following paginated pulls over HTTP
//! - **Streaming**: WebSocket push channel with reconnect and resubscribe
//! - **Router**: routes push events to the feeds subscribed on their topic
//! - **Sync**: refresh, expand and overflow resync
//! - **Dequeue**: manual and timed flushing of pending queues

mod config;
pub mod dequeue;
mod entity;
mod error;
pub mod feed;
mod feed_id;
pub mod pager;
mod pending;
pub mod policy;
pub mod registry;
pub mod router;
pub mod stream;
pub mod sync;
mod types;

pub use config::{
    DEFAULT_MAX_QUEUED_NOTIFICATIONS, DEFAULT_MAX_QUEUED_TIMELINE, DEFAULT_PAGE_LIMIT,
    EngineConfig, FeedConfig,
};
pub use dequeue::{DequeueHandle, DequeueScheduler};
pub use entity::{
    EntityCache, MemoryEntityCache, chat_message_from_json, html_to_text, notification_from_json,
    status_from_json,
};
pub use error::{FeedError, PullError};
pub use feed::{
    DequeueStep, Feed, FeedSnapshot, OrderedIds, PullApplied, PullTicket, PushOutcome,
};
pub use feed_id::{AccountView, FeedId, FeedKind, GroupView, Resource, StreamTopic};
pub use pager::{CursorPager, HttpPager, PullRequest, parse_link_header};
pub use pending::PendingLocalItems;
pub use policy::{AcceptAll, AcceptPolicy, AllOf, ColumnFilter, ColumnSettings};
pub use registry::{DequeueOutcome, FeedRegistry, FeedUpdate};
pub use router::{EventRouter, Routed};
pub use stream::{
    EventKind, PushEvent, StreamCommand, StreamHandle, StreamMessage, StreamStatus,
    StreamingClient,
};
pub use sync::{FeedSync, FeedSyncBuilder};
pub use types::*;
