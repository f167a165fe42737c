//! Core types shared across the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a status, notification or chat message.
pub type ItemId = String;

/// The normalized attributes of an item that the engine needs.
///
/// Full entities live in the [`EntityCache`](crate::EntityCache); feeds only
/// hold the `id`. The remaining fields feed the acceptance policy and the
/// own-content suppression check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: ItemId,
    /// Account that authored (or boosted, or triggered) the item.
    pub account_id: String,
    #[serde(default)]
    pub in_reply_to_id: Option<ItemId>,
    #[serde(default)]
    pub in_reply_to_account_id: Option<String>,
    /// For boosts, the id of the boosted status.
    #[serde(default)]
    pub reblog_of: Option<ItemId>,
    /// Plain-text body, used by body filters.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ItemRef {
    /// Minimal item with only an id and an origin account.
    pub fn new(id: impl Into<ItemId>, account_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            in_reply_to_id: None,
            in_reply_to_account_id: None,
            reblog_of: None,
            text: String::new(),
            created_at: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn replying_to(mut self, status_id: impl Into<ItemId>, account_id: impl Into<String>) -> Self {
        self.in_reply_to_id = Some(status_id.into());
        self.in_reply_to_account_id = Some(account_id.into());
        self
    }

    pub fn reblogging(mut self, status_id: impl Into<ItemId>) -> Self {
        self.reblog_of = Some(status_id.into());
        self
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to_id.is_some()
    }

    pub fn is_reblog(&self) -> bool {
        self.reblog_of.is_some()
    }
}

/// Opaque pagination token.
///
/// For HTTP pulls this is the URL from the `Link` header, followed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of a feed a pull extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullDirection {
    /// `since`-style pull of items newer than the head of the feed.
    Newer,
    /// `max_id`-style backfill of items older than the tail of the feed.
    Older,
}

/// One page returned by the cursor pager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullPage {
    /// Items, newest first.
    pub items: Vec<ItemRef>,
    pub next: Option<Cursor>,
    pub prev: Option<Cursor>,
    /// The server returned a degraded response (HTTP 206).
    pub partial: bool,
}

impl PullPage {
    pub fn new(items: Vec<ItemRef>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn with_next(mut self, cursor: impl Into<String>) -> Self {
        self.next = Some(Cursor::new(cursor));
        self
    }

    pub fn with_prev(mut self, cursor: impl Into<String>) -> Self {
        self.prev = Some(Cursor::new(cursor));
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }
}

/// Whether older items can still be backfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillState {
    /// A next cursor is known (or nothing has been pulled yet).
    #[default]
    More,
    /// The last page was partial; the same position must be retried.
    Partial,
    /// The server reported a clean end of the feed.
    Exhausted,
}

impl BackfillState {
    pub fn has_more(self) -> bool {
        !matches!(self, BackfillState::Exhausted)
    }
}
