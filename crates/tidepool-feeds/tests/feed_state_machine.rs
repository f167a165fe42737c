//! Stateful property testing for the feed state machine.
//!
//! Uses proptest-state-machine to interleave pushes, pulls, flushes and
//! clears against a registry-held feed. The reference model tracks:
//!
//! - Visible items (newest first) and the bounded pending queue
//! - The total-queued counter, including drops at capacity
//! - Connection, scroll position and the single in-flight pull
//! - Whether an abandoned pull ticket is still outstanding
//! - Accounts with outstanding local submissions

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use tidepool_feeds::{
    DequeueOutcome, EngineConfig, FeedConfig, FeedId, FeedRegistry, ItemRef, PullApplied,
    PullDirection, PullPage, PullTicket,
};

/// Queue cap used by the model and the harness.
const MAX_QUEUED: usize = 3;

/// Operations that can be performed on a feed.
#[derive(Debug, Clone)]
pub enum FeedOperation {
    Connect,
    Disconnect,
    SetAtTop(bool),
    /// Push an item authored by `account`.
    Push { id: u8, account: u8 },
    BeginPull(PullDirection),
    /// Complete the in-flight pull with a page of ids, newest first.
    CompletePull { ids: Vec<u8> },
    FailPull,
    /// Complete a pull whose feed was cleared after it began.
    CompleteStalePull { ids: Vec<u8> },
    /// Dequeue; `fresh` is what a resync would return.
    Dequeue { fresh: Vec<u8> },
    Clear,
    Delete { id: u8 },
    BeginCompose { account: u8 },
    ConfirmCompose { account: u8 },
}

/// Reference model of one feed.
#[derive(Clone, Debug, Default)]
pub struct FeedModel {
    pub items: Vec<String>,
    pub pending: VecDeque<String>,
    pub total_queued: usize,
    pub connected: bool,
    pub at_top: bool,
    pub loading: Option<PullDirection>,
    /// A pull was abandoned by a clear and its ticket is still held.
    pub stale: bool,
    pub composing: HashSet<String>,
}

fn id(n: u8) -> String {
    format!("s{}", n)
}

fn account(n: u8) -> String {
    format!("acct{}", n)
}

fn unique_ids(ids: &[u8]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|n| id(*n))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

impl FeedModel {
    fn clear(&mut self) {
        self.items.clear();
        self.pending.clear();
        self.total_queued = 0;
        if self.loading.take().is_some() {
            self.stale = true;
        }
    }
}

impl ReferenceStateMachine for FeedModel {
    type State = Self;
    type Transition = FeedOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        any::<bool>()
            .prop_map(|at_top| FeedModel {
                at_top,
                ..FeedModel::default()
            })
            .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let ids = prop::collection::vec(0u8..20, 0..6);
        if state.loading.is_some() {
            prop_oneof![
                4 => (0u8..20, 0u8..3).prop_map(|(id, account)| FeedOperation::Push { id, account }),
                3 => ids.clone().prop_map(|ids| FeedOperation::CompletePull { ids }),
                1 => Just(FeedOperation::FailPull),
                2 => ids.clone().prop_map(|fresh| FeedOperation::Dequeue { fresh }),
                1 => ids.prop_map(|ids| FeedOperation::CompleteStalePull { ids }),
                1 => Just(FeedOperation::Clear),
                1 => any::<bool>().prop_map(FeedOperation::SetAtTop),
            ]
            .boxed()
        } else {
            prop_oneof![
                1 => Just(FeedOperation::Connect),
                1 => Just(FeedOperation::Disconnect),
                1 => any::<bool>().prop_map(FeedOperation::SetAtTop),
                6 => (0u8..20, 0u8..3).prop_map(|(id, account)| FeedOperation::Push { id, account }),
                2 => prop_oneof![
                    Just(FeedOperation::BeginPull(PullDirection::Newer)),
                    Just(FeedOperation::BeginPull(PullDirection::Older)),
                ],
                2 => ids.clone().prop_map(|fresh| FeedOperation::Dequeue { fresh }),
                1 => ids.prop_map(|ids| FeedOperation::CompleteStalePull { ids }),
                1 => Just(FeedOperation::Clear),
                1 => (0u8..20).prop_map(|id| FeedOperation::Delete { id }),
                1 => (0u8..3).prop_map(|account| FeedOperation::BeginCompose { account }),
                1 => (0u8..3).prop_map(|account| FeedOperation::ConfirmCompose { account }),
            ]
            .boxed()
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            FeedOperation::Connect => state.connected = true,
            FeedOperation::Disconnect => state.connected = false,
            FeedOperation::SetAtTop(at_top) => state.at_top = *at_top,
            FeedOperation::Push { id: n, account: a } => {
                let item = id(*n);
                let blocked = !state.connected
                    || state.composing.contains(&account(*a))
                    || state.items.contains(&item)
                    || state.pending.contains(&item);
                if !blocked {
                    if state.at_top {
                        state.items.insert(0, item);
                    } else {
                        state.total_queued += 1;
                        if state.pending.len() < MAX_QUEUED {
                            state.pending.push_back(item);
                        }
                    }
                }
            }
            FeedOperation::BeginPull(direction) => {
                if state.loading.is_none() {
                    state.loading = Some(*direction);
                }
            }
            FeedOperation::CompletePull { ids } => {
                let page = unique_ids(ids);
                state.pending.retain(|id| !page.contains(id));
                let new_ids: Vec<String> = page
                    .into_iter()
                    .filter(|id| !state.items.contains(id))
                    .collect();
                match state.loading {
                    Some(PullDirection::Newer) => {
                        state.items.splice(0..0, new_ids);
                    }
                    Some(PullDirection::Older) => state.items.extend(new_ids),
                    None => {}
                }
                state.loading = None;
            }
            FeedOperation::FailPull => state.loading = None,
            FeedOperation::CompleteStalePull { .. } => state.stale = false,
            FeedOperation::Dequeue { fresh } => {
                if state.total_queued == 0 {
                    // Noop
                } else if state.total_queued <= MAX_QUEUED {
                    for id in state.pending.drain(..) {
                        state.items.insert(0, id);
                    }
                    state.total_queued = 0;
                } else {
                    state.clear();
                    state.items = unique_ids(fresh);
                }
            }
            FeedOperation::Clear => state.clear(),
            FeedOperation::Delete { id: n } => {
                let item = id(*n);
                state.items.retain(|id| *id != item);
                state.pending.retain(|id| *id != item);
            }
            FeedOperation::BeginCompose { account: a } => {
                state.composing.insert(account(*a));
            }
            FeedOperation::ConfirmCompose { account: a } => {
                state.composing.remove(&account(*a));
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            FeedOperation::CompletePull { .. } | FeedOperation::FailPull => state.loading.is_some(),
            FeedOperation::CompleteStalePull { .. } => state.stale,
            FeedOperation::BeginPull(_) => state.loading.is_none(),
            _ => true,
        }
    }
}

/// Test harness that drives a real registry with a tokio runtime.
pub struct FeedTestHarness {
    runtime: Runtime,
    registry: Arc<FeedRegistry>,
    ticket: Option<PullTicket>,
    stale_ticket: Option<PullTicket>,
}

impl FeedTestHarness {
    fn new(at_top: bool) -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let registry = FeedRegistry::new(EngineConfig::default());
        runtime.block_on(registry.configure(
            &FeedId::Home,
            FeedConfig::default()
                .with_max_queued(MAX_QUEUED)
                .at_top(at_top),
        ));
        Self {
            runtime,
            registry,
            ticket: None,
            stale_ticket: None,
        }
    }

    fn apply_operation(&mut self, op: &FeedOperation) {
        let registry = Arc::clone(&self.registry);
        let feed = FeedId::Home;
        let stale_ticket = self.stale_ticket;
        let (ticket, outcome) = self.runtime.block_on(async {
            match op {
                FeedOperation::Connect => {
                    registry.connect(&feed).await;
                    (None, None)
                }
                FeedOperation::Disconnect => {
                    registry.disconnect(&feed).await;
                    (None, None)
                }
                FeedOperation::SetAtTop(at_top) => {
                    registry.set_at_top(&feed, *at_top).await;
                    (None, None)
                }
                FeedOperation::Push { id: n, account: a } => {
                    registry
                        .push_item(&feed, &ItemRef::new(id(*n), account(*a)))
                        .await;
                    (None, None)
                }
                FeedOperation::BeginPull(direction) => {
                    (registry.begin_pull(&feed, *direction).await, None)
                }
                FeedOperation::CompletePull { ids } => {
                    let items = ids.iter().map(|n| ItemRef::new(id(*n), "puller")).collect();
                    if let Some(ticket) = self.ticket {
                        registry
                            .complete_pull(&feed, ticket, &PullPage::new(items))
                            .await;
                    }
                    (None, None)
                }
                FeedOperation::FailPull => {
                    if let Some(ticket) = self.ticket {
                        let error = tidepool_feeds::PullError::InvalidResponse("boom".into());
                        registry.fail_pull(&feed, ticket, &error).await;
                    }
                    (None, None)
                }
                FeedOperation::CompleteStalePull { ids } => {
                    let items = ids.iter().map(|n| ItemRef::new(id(*n), "puller")).collect();
                    let ticket = stale_ticket.expect("model tracks the abandoned ticket");
                    let applied = registry
                        .complete_pull(&feed, ticket, &PullPage::new(items))
                        .await;
                    assert_eq!(applied, PullApplied::Stale);
                    (None, None)
                }
                FeedOperation::Dequeue { fresh } => {
                    let items: Vec<ItemRef> =
                        fresh.iter().map(|n| ItemRef::new(id(*n), "puller")).collect();
                    let outcome = registry
                        .dequeue(&feed, |_| async move { Ok(PullPage::new(items)) })
                        .await
                        .expect("resync pull cannot fail here");
                    (None, Some(outcome))
                }
                FeedOperation::Clear => {
                    registry.clear(&feed).await;
                    (None, None)
                }
                FeedOperation::Delete { id: n } => {
                    registry.delete_item(&feed, &id(*n)).await;
                    (None, None)
                }
                FeedOperation::BeginCompose { account: a } => {
                    registry.pending_local().begin(&account(*a), "draft");
                    (None, None)
                }
                FeedOperation::ConfirmCompose { account: a } => {
                    registry.pending_local().confirm(&account(*a), "draft");
                    (None, None)
                }
            }
        });

        match op {
            FeedOperation::BeginPull(_) => {
                if ticket.is_some() {
                    self.ticket = ticket;
                }
            }
            FeedOperation::CompletePull { .. } | FeedOperation::FailPull => self.ticket = None,
            FeedOperation::CompleteStalePull { .. } => self.stale_ticket = None,
            FeedOperation::Clear => {
                if let Some(abandoned) = self.ticket.take() {
                    self.stale_ticket = Some(abandoned);
                }
            }
            FeedOperation::Dequeue { .. } => {
                if let Some(DequeueOutcome::Resynced(_)) = outcome
                    && let Some(abandoned) = self.ticket.take()
                {
                    self.stale_ticket = Some(abandoned);
                }
            }
            _ => {}
        }
    }

    fn verify_invariants(&self, model: &FeedModel) {
        let snapshot = self
            .runtime
            .block_on(self.registry.snapshot(&FeedId::Home))
            .expect("feed exists");

        // Invariant 1: no duplicate ids
        let unique: HashSet<&String> = snapshot.items.iter().collect();
        assert_eq!(unique.len(), snapshot.items.len(), "duplicate ids in {:?}", snapshot.items);

        // Invariant 2: visible and queued ids are disjoint
        for id in &snapshot.pending {
            assert!(!unique.contains(id), "{} is both visible and queued", id);
        }

        // Invariant 3: the counter bounds the queue
        assert!(
            snapshot.total_queued >= snapshot.pending.len(),
            "total_queued {} < queue length {}",
            snapshot.total_queued,
            snapshot.pending.len()
        );
        assert!(snapshot.pending.len() <= MAX_QUEUED);

        // State matches model
        assert_eq!(snapshot.items, model.items, "items mismatch");
        assert_eq!(
            snapshot.pending,
            model.pending.iter().cloned().collect::<Vec<_>>(),
            "pending mismatch"
        );
        assert_eq!(snapshot.total_queued, model.total_queued);
        assert_eq!(snapshot.connected, model.connected);
        assert_eq!(snapshot.is_at_top, model.at_top);
        assert_eq!(snapshot.is_loading, model.loading.is_some());
    }
}

impl StateMachineTest for FeedTestHarness {
    type SystemUnderTest = Self;
    type Reference = FeedModel;

    fn init_test(
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new(ref_state.at_top)
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        // Use fewer cases for CI, increase with PROPTEST_CASES env var
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn feed_state_machine_test(sequential 1..60 => FeedTestHarness);
}

// Additional targeted property tests

proptest! {
    /// A flush only ever prepends; the previously visible items keep their order.
    #[test]
    fn flush_never_reorders_items(
        visible in prop::collection::vec(0u8..50, 0..10),
        queued in prop::collection::vec(50u8..100, 1..=MAX_QUEUED),
    ) {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.block_on(async {
            let registry = FeedRegistry::new(EngineConfig::default());
            let feed = FeedId::Home;
            registry
                .configure(&feed, FeedConfig::default().with_max_queued(MAX_QUEUED).at_top(false))
                .await;
            registry.connect(&feed).await;

            let ticket = registry.begin_pull(&feed, PullDirection::Newer).await.unwrap();
            let page = PullPage::new(visible.iter().map(|n| ItemRef::new(id(*n), "a")).collect());
            registry.complete_pull(&feed, ticket, &page).await;
            let before = registry.snapshot(&feed).await.unwrap().items;

            for n in &queued {
                registry.push_item(&feed, &ItemRef::new(id(*n), "a")).await;
            }
            registry
                .dequeue(&feed, |_| async { Ok(PullPage::default()) })
                .await
                .unwrap();

            let after = registry.snapshot(&feed).await.unwrap().items;
            prop_assert!(after.ends_with(&before));
            let flushed = &after[..after.len() - before.len()];
            let expected: Vec<String> = unique_ids(&queued).into_iter().rev().collect();
            prop_assert_eq!(flushed.to_vec(), expected);
            Ok(())
        })?;
    }

    /// After an overflow, the feed holds exactly the resync page.
    #[test]
    fn overflow_resync_is_a_hard_cut(
        visible in prop::collection::vec(0u8..50, 0..10),
        extra in 1usize..5,
        fresh in prop::collection::vec(100u8..150, 0..8),
    ) {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.block_on(async {
            let registry = FeedRegistry::new(EngineConfig::default());
            let feed = FeedId::Home;
            registry
                .configure(&feed, FeedConfig::default().with_max_queued(MAX_QUEUED).at_top(false))
                .await;
            registry.connect(&feed).await;

            let ticket = registry.begin_pull(&feed, PullDirection::Newer).await.unwrap();
            let page = PullPage::new(visible.iter().map(|n| ItemRef::new(id(*n), "a")).collect());
            registry.complete_pull(&feed, ticket, &page).await;

            for n in 0..(MAX_QUEUED + extra) {
                registry.push_item(&feed, &ItemRef::new(format!("q{}", n), "a")).await;
            }

            let fresh_items: Vec<ItemRef> =
                fresh.iter().map(|n| ItemRef::new(id(*n), "a")).collect();
            let outcome = registry
                .dequeue(&feed, |_| async move { Ok(PullPage::new(fresh_items)) })
                .await
                .unwrap();
            prop_assert_eq!(outcome, DequeueOutcome::Resynced(fresh.len()));

            let snapshot = registry.snapshot(&feed).await.unwrap();
            prop_assert_eq!(snapshot.items, unique_ids(&fresh));
            prop_assert!(snapshot.pending.is_empty());
            prop_assert_eq!(snapshot.total_queued, 0);
            Ok(())
        })?;
    }
}
