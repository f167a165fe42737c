//! Acceptance policies for pushed items.
//!
//! Every feed carries exactly one [`AcceptPolicy`]. It is evaluated once per
//! pushed item, synchronously, with no I/O. Rejected items are dropped and
//! never reach the visible set or the pending queue.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::ItemRef;

/// Decides whether a pushed item may be shown in a feed.
pub trait AcceptPolicy: Send + Sync {
    fn accept(&self, item: &ItemRef) -> bool;
}

impl<F> AcceptPolicy for F
where
    F: Fn(&ItemRef) -> bool + Send + Sync,
{
    fn accept(&self, item: &ItemRef) -> bool {
        self(item)
    }
}

/// Accepts every item. The default policy for new feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {
    fn accept(&self, _item: &ItemRef) -> bool {
        true
    }
}

/// Accepts an item only if every inner policy does.
#[derive(Clone, Default)]
pub struct AllOf(pub Vec<Arc<dyn AcceptPolicy>>);

impl AcceptPolicy for AllOf {
    fn accept(&self, item: &ItemRef) -> bool {
        self.0.iter().all(|p| p.accept(item))
    }
}

/// Per-column display settings, in the shape clients persist them.
///
/// ```json
/// { "shows": { "reblog": false, "reply": true }, "regex": { "body": "spoiler" } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ColumnSettings {
    pub shows: ShowSettings,
    pub regex: RegexSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShowSettings {
    pub reblog: bool,
    pub reply: bool,
}

impl Default for ShowSettings {
    fn default() -> Self {
        Self {
            reblog: true,
            reply: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegexSettings {
    pub body: String,
}

/// Column filter: hide replies, hide boosts, hide bodies matching a regex.
#[derive(Debug, Clone, Default)]
pub struct ColumnFilter {
    hide_replies: bool,
    hide_reblogs: bool,
    body: Option<Regex>,
}

impl ColumnFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hide_replies(mut self, hide: bool) -> Self {
        self.hide_replies = hide;
        self
    }

    pub fn hide_reblogs(mut self, hide: bool) -> Self {
        self.hide_reblogs = hide;
        self
    }

    /// Hide items whose body matches `pattern` (case-insensitive).
    ///
    /// An invalid pattern is logged and ignored rather than hiding everything.
    pub fn body_regex(mut self, pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            self.body = None;
            return self;
        }
        match Regex::new(&format!("(?i){}", pattern)) {
            Ok(re) => self.body = Some(re),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "ignoring invalid column regex");
                self.body = None;
            }
        }
        self
    }

    pub fn from_settings(settings: &ColumnSettings) -> Self {
        Self::new()
            .hide_replies(!settings.shows.reply)
            .hide_reblogs(!settings.shows.reblog)
            .body_regex(&settings.regex.body)
    }
}

impl AcceptPolicy for ColumnFilter {
    fn accept(&self, item: &ItemRef) -> bool {
        if self.hide_reblogs && item.is_reblog() {
            return false;
        }

        // Self-threads stay visible with replies hidden.
        if self.hide_replies
            && item.is_reply()
            && item.in_reply_to_account_id.as_deref() != Some(item.account_id.as_str())
        {
            return false;
        }

        if let Some(re) = &self.body {
            if re.is_match(&item.text) {
                return false;
            }
        }

        true
    }
}
