//! Per-feed state machine.
//!
//! A [`Feed`] owns the visible ids, the bounded pending queue, the pagination
//! cursors and the loading/connection flags of one named feed. Pull results
//! and pushed items are both applied here under one consistency policy:
//!
//! - `items` is a set; re-inserting an id is a no-op
//! - `items` and the pending queue never share an id
//! - the pull cycle is `Idle -> Loading -> Idle`, one pull at a time
//! - a queue overflow is repaired by a full resync, never a partial merge
//!
//! `Feed` is plain data with no locking; [`FeedRegistry`](crate::FeedRegistry)
//! serializes access to each feed.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    AcceptPolicy, BackfillState, Cursor, FeedConfig, FeedId, ItemId, ItemRef, PendingLocalItems,
    PullDirection, PullPage,
};

/// Insertion-ordered set of ids.
#[derive(Debug, Clone, Default)]
pub struct OrderedIds {
    order: VecDeque<ItemId>,
    index: HashSet<ItemId>,
}

impl OrderedIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemId> {
        self.order.iter()
    }

    pub fn first(&self) -> Option<&ItemId> {
        self.order.front()
    }

    pub fn last(&self) -> Option<&ItemId> {
        self.order.back()
    }

    pub fn push_front(&mut self, id: ItemId) -> bool {
        if !self.index.insert(id.clone()) {
            return false;
        }
        self.order.push_front(id);
        true
    }

    pub fn push_back(&mut self, id: ItemId) -> bool {
        if !self.index.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.index.remove(id) {
            return false;
        }
        self.order.retain(|existing| existing != id);
        true
    }

    /// Keep only ids for which `keep` returns true. Returns the number removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let before = self.order.len();
        let index = &mut self.index;
        self.order.retain(|id| {
            let kept = keep(id);
            if !kept {
                index.remove(id);
            }
            kept
        });
        before - self.order.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }

    /// Remove and return every id, in order.
    pub fn drain(&mut self) -> Vec<ItemId> {
        self.index.clear();
        self.order.drain(..).collect()
    }

    pub fn to_vec(&self) -> Vec<ItemId> {
        self.order.iter().cloned().collect()
    }
}

/// Handle for one in-flight pull.
///
/// Returned by [`Feed::begin_pull`]; completing or failing the pull requires
/// it. Clearing a feed abandons its in-flight pull, and the stale ticket is
/// then ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullTicket {
    pub direction: PullDirection,
    generation: u64,
}

/// What happened to a pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Inserted at the front of the visible items.
    Inserted,
    /// Appended to the pending queue.
    Queued,
    /// Counted but dropped because the queue was at capacity.
    QueueFull,
    /// Already visible or already queued.
    Duplicate,
    /// Dropped by the feed's acceptance policy.
    Rejected,
    /// Dropped because the author has unconfirmed local submissions.
    SuppressedOwn,
    /// Not delivered: the feed's push subscription is closed.
    NotConnected,
}

/// Result of applying a completed pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullApplied {
    /// The page was merged; `added` ids were new.
    Merged { added: usize },
    /// The ticket no longer matches the feed (it was cleared mid-pull).
    Stale,
}

/// Result of [`Feed::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueStep {
    /// Nothing was queued.
    Noop,
    /// The queue was moved into the visible items.
    Flushed(usize),
    /// The queue overflowed: the feed was cleared and a fresh newest pull
    /// has begun. The caller performs it and completes the ticket.
    Resync(PullTicket),
}

/// Point-in-time copy of a feed's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub id: FeedId,
    pub items: Vec<ItemId>,
    pub pending: Vec<ItemId>,
    pub total_queued: usize,
    pub next_cursor: Option<Cursor>,
    pub prev_cursor: Option<Cursor>,
    pub backfill: BackfillState,
    pub is_loading: bool,
    pub connected: bool,
    pub is_at_top: bool,
    pub loaded: bool,
}

/// State of one named feed.
pub struct Feed {
    id: FeedId,
    items: OrderedIds,
    /// Queued ids in arrival order, oldest first.
    pending: OrderedIds,
    total_queued: usize,
    next_cursor: Option<Cursor>,
    prev_cursor: Option<Cursor>,
    backfill: BackfillState,
    in_flight: Option<PullTicket>,
    generation: u64,
    connected: bool,
    is_at_top: bool,
    loaded: bool,
    max_queued: usize,
    policy: Arc<dyn AcceptPolicy>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("id", &self.id)
            .field("items", &self.items.len())
            .field("pending", &self.pending.len())
            .field("total_queued", &self.total_queued)
            .field("backfill", &self.backfill)
            .field("is_loading", &self.is_loading())
            .field("connected", &self.connected)
            .field("is_at_top", &self.is_at_top)
            .finish_non_exhaustive()
    }
}

impl Feed {
    pub fn new(id: FeedId, config: FeedConfig) -> Self {
        Self {
            id,
            items: OrderedIds::new(),
            pending: OrderedIds::new(),
            total_queued: 0,
            next_cursor: None,
            prev_cursor: None,
            backfill: BackfillState::More,
            in_flight: None,
            generation: 0,
            connected: false,
            is_at_top: config.is_at_top,
            loaded: false,
            max_queued: config.max_queued,
            policy: config.policy,
        }
    }

    /// Replace queue cap and policy. Items and cursors are kept.
    pub fn reconfigure(&mut self, config: FeedConfig) {
        self.max_queued = config.max_queued;
        self.policy = config.policy;
        self.is_at_top = config.is_at_top;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &FeedId {
        &self.id
    }

    pub fn items(&self) -> &OrderedIds {
        &self.items
    }

    pub fn pending(&self) -> &OrderedIds {
        &self.pending
    }

    pub fn total_queued(&self) -> usize {
        self.total_queued
    }

    pub fn max_queued(&self) -> usize {
        self.max_queued
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.next_cursor.as_ref()
    }

    pub fn prev_cursor(&self) -> Option<&Cursor> {
        self.prev_cursor.as_ref()
    }

    pub fn backfill(&self) -> BackfillState {
        self.backfill
    }

    /// Whether older items may still be backfilled.
    ///
    /// True after a partial page even when no next cursor was returned.
    pub fn has_more(&self) -> bool {
        self.backfill.has_more()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_at_top(&self) -> bool {
        self.is_at_top
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            id: self.id.clone(),
            items: self.items.to_vec(),
            pending: self.pending.to_vec(),
            total_queued: self.total_queued,
            next_cursor: self.next_cursor.clone(),
            prev_cursor: self.prev_cursor.clone(),
            backfill: self.backfill,
            is_loading: self.is_loading(),
            connected: self.connected,
            is_at_top: self.is_at_top,
            loaded: self.loaded,
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Returns true if the flag changed.
    pub fn connect(&mut self) -> bool {
        !std::mem::replace(&mut self.connected, true)
    }

    /// Returns true if the flag changed.
    pub fn disconnect(&mut self) -> bool {
        std::mem::replace(&mut self.connected, false)
    }

    pub fn set_at_top(&mut self, at_top: bool) {
        self.is_at_top = at_top;
    }

    // =========================================================================
    // Pull cycle
    // =========================================================================

    /// Start a pull. Returns `None` if one is already in flight.
    pub fn begin_pull(&mut self, direction: PullDirection) -> Option<PullTicket> {
        if self.in_flight.is_some() {
            debug!(feed = %self.id, ?direction, "pull already in flight, skipping");
            return None;
        }
        let ticket = PullTicket {
            direction,
            generation: self.generation,
        };
        self.in_flight = Some(ticket);
        trace!(feed = %self.id, ?direction, "pull started");
        Some(ticket)
    }

    fn take_ticket(&mut self, ticket: PullTicket) -> bool {
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Merge a completed page and end the pull.
    pub fn complete_pull(&mut self, ticket: PullTicket, page: &PullPage) -> PullApplied {
        if !self.take_ticket(ticket) {
            debug!(feed = %self.id, "discarding stale pull result");
            return PullApplied::Stale;
        }

        let fresh_load = !self.loaded || self.items.is_empty();
        let ids = page.ids();

        // Pulled items win over queued copies.
        for id in &ids {
            self.pending.remove(id);
        }

        let added = match ticket.direction {
            PullDirection::Newer => {
                let new_ids: Vec<&ItemId> = {
                    let mut seen = HashSet::new();
                    ids.iter()
                        .filter(|id| !self.items.contains(id) && seen.insert(id.as_str()))
                        .collect()
                };
                let added = new_ids.len();
                for id in new_ids.into_iter().rev() {
                    self.items.push_front(id.clone());
                }

                if !page.partial
                    && let Some(prev) = &page.prev
                {
                    self.prev_cursor = Some(prev.clone());
                }
                if fresh_load {
                    self.apply_next_cursor(page);
                }
                added
            }
            PullDirection::Older => {
                let added = ids
                    .into_iter()
                    .filter(|id| self.items.push_back(id.clone()))
                    .count();
                if fresh_load
                    && !page.partial
                    && let Some(prev) = &page.prev
                {
                    self.prev_cursor = Some(prev.clone());
                }
                self.apply_next_cursor(page);
                added
            }
        };

        self.loaded = true;
        trace!(
            feed = %self.id,
            direction = ?ticket.direction,
            added,
            partial = page.partial,
            backfill = ?self.backfill,
            "pull merged"
        );
        PullApplied::Merged { added }
    }

    /// A partial page never moves the next cursor, so the gap is retried.
    fn apply_next_cursor(&mut self, page: &PullPage) {
        if page.partial {
            self.backfill = BackfillState::Partial;
        } else {
            self.next_cursor = page.next.clone();
            self.backfill = if self.next_cursor.is_some() {
                BackfillState::More
            } else {
                BackfillState::Exhausted
            };
        }
    }

    /// End a failed pull. Items and cursors are left as they were.
    pub fn fail_pull(&mut self, ticket: PullTicket) -> bool {
        let matched = self.take_ticket(ticket);
        if matched {
            debug!(feed = %self.id, direction = ?ticket.direction, "pull failed");
        }
        matched
    }

    // =========================================================================
    // Push ingestion
    // =========================================================================

    /// Apply a pushed item.
    ///
    /// Order of checks: own-content suppression, acceptance policy,
    /// duplicate, then insert (at top) or queue (scrolled away).
    pub fn push_item(&mut self, item: &ItemRef, pending_local: &PendingLocalItems) -> PushOutcome {
        if pending_local.has_outstanding(&item.account_id) {
            trace!(feed = %self.id, id = %item.id, "suppressing pushed copy of own pending item");
            return PushOutcome::SuppressedOwn;
        }

        if !self.policy.accept(item) {
            trace!(feed = %self.id, id = %item.id, "pushed item rejected by policy");
            return PushOutcome::Rejected;
        }

        if self.items.contains(&item.id) || self.pending.contains(&item.id) {
            return PushOutcome::Duplicate;
        }

        if self.is_at_top {
            self.items.push_front(item.id.clone());
            trace!(feed = %self.id, id = %item.id, "pushed item inserted");
            return PushOutcome::Inserted;
        }

        // Counted even when dropped, so Dequeue can detect the overflow.
        self.total_queued += 1;
        if self.pending.len() < self.max_queued {
            self.pending.push_back(item.id.clone());
            trace!(feed = %self.id, id = %item.id, queued = self.pending.len(), "pushed item queued");
            PushOutcome::Queued
        } else {
            trace!(
                feed = %self.id,
                id = %item.id,
                total_queued = self.total_queued,
                "queue full, dropping pushed item"
            );
            PushOutcome::QueueFull
        }
    }

    // =========================================================================
    // Dequeue
    // =========================================================================

    /// Flush the pending queue, or clear the feed and start a resync pull if
    /// more items arrived than the queue could hold.
    pub fn dequeue(&mut self) -> DequeueStep {
        if self.total_queued == 0 {
            return DequeueStep::Noop;
        }

        if self.total_queued <= self.max_queued {
            let queued = self.pending.drain();
            let flushed = queued.len();
            // Oldest first, so the newest-queued item ends up at the front.
            for id in queued {
                self.items.push_front(id);
            }
            self.total_queued = 0;
            debug!(feed = %self.id, flushed, "pending queue flushed");
            return DequeueStep::Flushed(flushed);
        }

        let total_queued = self.total_queued;
        self.clear();
        let ticket = PullTicket {
            direction: PullDirection::Newer,
            generation: self.generation,
        };
        self.in_flight = Some(ticket);
        debug!(
            feed = %self.id,
            total_queued,
            max_queued = self.max_queued,
            "pending queue overflowed, feed cleared for resync"
        );
        DequeueStep::Resync(ticket)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Reset items, queue, counter and cursors. The connection flag is kept;
    /// any in-flight pull is abandoned.
    pub fn clear(&mut self) {
        self.items.clear();
        self.pending.clear();
        self.total_queued = 0;
        self.next_cursor = None;
        self.prev_cursor = None;
        self.backfill = BackfillState::More;
        self.loaded = false;
        self.in_flight = None;
        self.generation += 1;
        trace!(feed = %self.id, "feed cleared");
    }

    /// Remove an item (e.g. deleted server-side). No-op if absent.
    pub fn delete_item(&mut self, id: &str) -> bool {
        let removed = self.items.remove(id);
        let dequeued = self.pending.remove(id);
        removed || dequeued
    }

    /// Remove every visible or queued item matching `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&str) -> bool) -> usize {
        let visible = self.items.retain(|id| !predicate(id));
        visible + self.pending.retain(|id| !predicate(id))
    }

    /// Insert a freshly confirmed local item at the front.
    pub fn prepend_confirmed(&mut self, id: &str) -> bool {
        self.pending.remove(id);
        self.items.push_front(id.to_string())
    }
}
