//! Outstanding optimistic (not yet confirmed) local items.
//!
//! The compose side registers an idempotency key when it submits a post and
//! resolves it on confirmation or failure. While an account has any key
//! outstanding, pushed items authored by that account are suppressed: the
//! pushed copy carries no idempotency key, so it cannot be reconciled with
//! the optimistic entry.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

/// Per-account sets of outstanding idempotency keys.
#[derive(Debug, Default)]
pub struct PendingLocalItems {
    outstanding: DashMap<String, HashSet<String>>,
}

impl PendingLocalItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a submission. Returns false if the key was already outstanding.
    pub fn begin(&self, account_id: &str, key: impl Into<String>) -> bool {
        let key = key.into();
        let added = self
            .outstanding
            .entry(account_id.to_string())
            .or_default()
            .insert(key.clone());
        debug!(account = %account_id, key = %key, added, "pending local item registered");
        added
    }

    /// Resolve a submission that the server confirmed.
    pub fn confirm(&self, account_id: &str, key: &str) -> bool {
        self.resolve(account_id, key)
    }

    /// Resolve a submission that failed.
    pub fn fail(&self, account_id: &str, key: &str) -> bool {
        self.resolve(account_id, key)
    }

    fn resolve(&self, account_id: &str, key: &str) -> bool {
        match self.outstanding.entry(account_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(key);
                if entry.get().is_empty() {
                    entry.remove();
                }
                debug!(account = %account_id, key = %key, removed, "pending local item resolved");
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Whether the account has at least one unconfirmed submission.
    pub fn has_outstanding(&self, account_id: &str) -> bool {
        self.outstanding
            .get(account_id)
            .is_some_and(|keys| !keys.is_empty())
    }

    pub fn count(&self, account_id: &str) -> usize {
        self.outstanding
            .get(account_id)
            .map(|keys| keys.len())
            .unwrap_or(0)
    }
}
