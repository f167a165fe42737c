//! Entity cache and payload normalization.
//!
//! Feeds only store ids. The cache holds the normalized [`ItemRef`] behind
//! each id and is shared by every feed, so the same status appearing in two
//! timelines is stored once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scraper::{Html, Node};
use serde_json::Value;
use tracing::trace;

use crate::{FeedError, ItemId, ItemRef};

/// Concurrency-safe store of normalized items, keyed by id.
pub trait EntityCache: Send + Sync {
    /// Insert or replace an item.
    fn upsert(&self, item: ItemRef);

    fn get(&self, id: &str) -> Option<ItemRef>;

    fn remove(&self, id: &str) -> Option<ItemRef>;

    /// Ids of cached boosts of the given status.
    fn reblogs_of(&self, id: &str) -> Vec<ItemId>;

    fn upsert_all(&self, items: &[ItemRef]) {
        for item in items {
            self.upsert(item.clone());
        }
    }
}

/// In-memory [`EntityCache`] backed by a `DashMap`.
#[derive(Default)]
pub struct MemoryEntityCache {
    items: DashMap<ItemId, ItemRef>,
}

impl MemoryEntityCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl EntityCache for MemoryEntityCache {
    fn upsert(&self, item: ItemRef) {
        trace!(id = %item.id, "cache: item upserted");
        self.items.insert(item.id.clone(), item);
    }

    fn get(&self, id: &str) -> Option<ItemRef> {
        self.items.get(id).map(|r| r.value().clone())
    }

    fn remove(&self, id: &str) -> Option<ItemRef> {
        let removed = self.items.remove(id).map(|(_, item)| item);
        if removed.is_some() {
            trace!(id = %id, "cache: item removed");
        }
        removed
    }

    fn reblogs_of(&self, id: &str) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|r| r.value().reblog_of.as_deref() == Some(id))
            .map(|r| r.key().clone())
            .collect()
    }
}

// =============================================================================
// Normalization
// =============================================================================

fn invalid(event: &str, reason: impl Into<String>) -> FeedError {
    FeedError::InvalidPayload {
        event: event.to_string(),
        reason: reason.into(),
    }
}

fn opt_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn req_str(value: &Value, key: &str, event: &str) -> Result<String, FeedError> {
    opt_str(value, key).ok_or_else(|| invalid(event, format!("missing `{}`", key)))
}

fn created_at(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Reduce an HTML status body to plain text for body filters.
///
/// Entities are decoded exactly once. Paragraphs and line breaks become
/// newlines; non-breaking spaces become plain spaces.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());

    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => match element.name() {
                "br" => out.push('\n'),
                "p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            _ => {}
        }
    }

    out.replace('\u{a0}', " ").trim().to_string()
}

/// Normalize a status payload (`update`, `status.update`, timeline pages).
pub fn status_from_json(value: &Value) -> Result<ItemRef, FeedError> {
    const EVENT: &str = "status";
    let id = req_str(value, "id", EVENT)?;
    let account = value
        .get("account")
        .ok_or_else(|| invalid(EVENT, "missing `account`"))?;
    let account_id = req_str(account, "id", EVENT)?;
    let reblog_of = value
        .get("reblog")
        .filter(|r| !r.is_null())
        .and_then(|r| opt_str(r, "id"));

    // A boost's own content is empty; filter on the boosted body.
    let content = value
        .get("reblog")
        .filter(|r| !r.is_null())
        .unwrap_or(value)
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("");

    Ok(ItemRef {
        id,
        account_id,
        in_reply_to_id: opt_str(value, "in_reply_to_id"),
        in_reply_to_account_id: opt_str(value, "in_reply_to_account_id"),
        reblog_of,
        text: html_to_text(content),
        created_at: created_at(value),
    })
}

/// Normalize a notification payload.
pub fn notification_from_json(value: &Value) -> Result<ItemRef, FeedError> {
    const EVENT: &str = "notification";
    let id = req_str(value, "id", EVENT)?;
    let account = value
        .get("account")
        .ok_or_else(|| invalid(EVENT, "missing `account`"))?;
    let text = value
        .get("status")
        .and_then(|s| s.get("content"))
        .and_then(Value::as_str)
        .map(html_to_text)
        .unwrap_or_default();

    Ok(ItemRef {
        id,
        account_id: req_str(account, "id", EVENT)?,
        in_reply_to_id: None,
        in_reply_to_account_id: None,
        reblog_of: None,
        text,
        created_at: created_at(value),
    })
}

/// Normalize a chat message payload. Returns the chat id alongside the item.
pub fn chat_message_from_json(value: &Value) -> Result<(String, ItemRef), FeedError> {
    const EVENT: &str = "chat_message";
    let chat_id = req_str(value, "chat_id", EVENT)?;
    let item = ItemRef {
        id: req_str(value, "id", EVENT)?,
        account_id: req_str(value, "account_id", EVENT)?,
        in_reply_to_id: None,
        in_reply_to_account_id: None,
        reblog_of: None,
        text: value
            .get("content")
            .and_then(Value::as_str)
            .map(html_to_text)
            .unwrap_or_default(),
        created_at: created_at(value),
    };
    Ok((chat_id, item))
}
