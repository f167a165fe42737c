//! End-to-end feed scenarios through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;

use tidepool_feeds::{
    BackfillState, ColumnFilter, DequeueOutcome, EngineConfig, EventRouter, FeedConfig, FeedId,
    FeedRegistry, FeedUpdate, ItemRef, MemoryEntityCache, PullDirection, PullError, PullPage, PushEvent,
    PushOutcome, Routed, StreamTopic,
};

fn item(id: &str) -> ItemRef {
    ItemRef::new(id, "someone")
}

async fn connected_home(max_queued: usize, at_top: bool) -> Arc<FeedRegistry> {
    let registry = FeedRegistry::new(EngineConfig::default());
    registry
        .configure(
            &FeedId::Home,
            FeedConfig::default().with_max_queued(max_queued).at_top(at_top),
        )
        .await;
    registry.connect(&FeedId::Home).await;
    registry
}

#[tokio::test]
async fn scenario_a_overflow_resyncs() {
    let registry = connected_home(3, false).await;

    let outcomes = [
        registry.push_item(&FeedId::Home, &item("a")).await,
        registry.push_item(&FeedId::Home, &item("b")).await,
        registry.push_item(&FeedId::Home, &item("c")).await,
        registry.push_item(&FeedId::Home, &item("d")).await,
    ];
    assert_eq!(
        outcomes,
        [
            PushOutcome::Queued,
            PushOutcome::Queued,
            PushOutcome::Queued,
            PushOutcome::QueueFull,
        ]
    );

    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert_eq!(snapshot.pending, vec!["a", "b", "c"]);
    assert_eq!(snapshot.total_queued, 4);

    let resyncs = AtomicUsize::new(0);
    let outcome = registry
        .dequeue(&FeedId::Home, |feed| {
            resyncs.fetch_add(1, Ordering::SeqCst);
            assert_eq!(feed, FeedId::Home);
            async { Ok(PullPage::new(vec![item("z"), item("y")])) }
        })
        .await
        .unwrap();

    assert_eq!(outcome, DequeueOutcome::Resynced(2));
    assert_eq!(resyncs.load(Ordering::SeqCst), 1);

    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.total_queued, 0);
    assert_eq!(snapshot.items, vec!["z", "y"]);
    assert!(!snapshot.is_loading);
}

#[tokio::test]
async fn scenario_b_flush_puts_newest_first() {
    let registry = connected_home(40, false).await;
    registry.push_item(&FeedId::Home, &item("a")).await;
    registry.push_item(&FeedId::Home, &item("b")).await;

    let outcome = registry
        .dequeue(&FeedId::Home, |_| async {
            Err(PullError::InvalidResponse("no resync expected".into()))
        })
        .await
        .unwrap();
    assert_eq!(outcome, DequeueOutcome::Flushed(2));

    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert_eq!(snapshot.items, vec!["b", "a"]);
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.total_queued, 0);
}

#[tokio::test]
async fn scenario_c_at_top_inserts_directly() {
    let registry = connected_home(40, true).await;
    let ticket = registry
        .begin_pull(&FeedId::Home, PullDirection::Newer)
        .await
        .unwrap();
    registry
        .complete_pull(&FeedId::Home, ticket, &PullPage::new(vec![item("old")]))
        .await;

    let outcome = registry.push_item(&FeedId::Home, &item("x")).await;
    assert_eq!(outcome, PushOutcome::Inserted);

    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert_eq!(snapshot.items, vec!["x", "old"]);
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.total_queued, 0);
}

#[tokio::test]
async fn scenario_d_partial_page_keeps_backfill_open() {
    let registry = connected_home(40, true).await;
    let ticket = registry
        .begin_pull(&FeedId::Home, PullDirection::Older)
        .await
        .unwrap();
    registry
        .complete_pull(
            &FeedId::Home,
            ticket,
            &PullPage::new(vec![item("3"), item("2")]).partial(),
        )
        .await;

    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert_eq!(snapshot.next_cursor, None);
    assert_eq!(snapshot.backfill, BackfillState::Partial);
    assert!(snapshot.backfill.has_more());
}

#[tokio::test]
async fn own_content_is_suppressed_while_pending() {
    let registry = connected_home(40, true).await;
    registry.pending_local().begin("me", "idem-1");

    assert_eq!(
        registry
            .push_item(&FeedId::Home, &ItemRef::new("1", "me"))
            .await,
        PushOutcome::SuppressedOwn
    );
    assert_eq!(
        registry
            .push_item(&FeedId::Home, &ItemRef::new("2", "you"))
            .await,
        PushOutcome::Inserted
    );

    registry.pending_local().confirm("me", "idem-1");
    assert!(registry.prepend_confirmed(&FeedId::Home, "1").await);
    assert_eq!(
        registry
            .push_item(&FeedId::Home, &ItemRef::new("1", "me"))
            .await,
        PushOutcome::Duplicate
    );

    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert_eq!(snapshot.items, vec!["1", "2"]);
}

#[tokio::test]
async fn column_filter_drops_before_queueing() {
    let registry = connected_home(40, false).await;
    registry
        .configure(
            &FeedId::Home,
            FeedConfig::default()
                .at_top(false)
                .with_policy(ColumnFilter::default().hide_reblogs(true)),
        )
        .await;

    let boost = ItemRef::new("b1", "someone").reblogging("s1");
    assert_eq!(
        registry.push_item(&FeedId::Home, &boost).await,
        PushOutcome::Rejected
    );
    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert_eq!(snapshot.total_queued, 0);
    assert!(snapshot.pending.is_empty());
}

#[tokio::test]
async fn reconnect_does_not_duplicate_subscriptions() {
    let registry = FeedRegistry::new(EngineConfig::default());
    let router = EventRouter::new(Arc::clone(&registry), MemoryEntityCache::new());
    let topic = FeedId::Home.stream_topic().unwrap();

    assert!(registry.connect(&FeedId::Home).await);
    assert!(router.add_subscription(topic.clone(), FeedId::Home));
    assert!(!registry.connect(&FeedId::Home).await);
    assert!(!router.add_subscription(topic.clone(), FeedId::Home));
    assert_eq!(router.topics(), vec![topic.clone()]);

    let routed = router
        .route(&topic, PushEvent::Update(item("1")))
        .await;
    assert_eq!(routed, Routed::Pushed(vec![(FeedId::Home, PushOutcome::Inserted)]));
}

#[tokio::test]
async fn disconnect_stops_delivery_but_pull_lands() {
    let registry = connected_home(40, true).await;
    let ticket = registry
        .begin_pull(&FeedId::Home, PullDirection::Newer)
        .await
        .unwrap();
    registry.disconnect(&FeedId::Home).await;

    assert_eq!(
        registry.push_item(&FeedId::Home, &item("pushed")).await,
        PushOutcome::NotConnected
    );
    registry
        .complete_pull(&FeedId::Home, ticket, &PullPage::new(vec![item("pulled")]))
        .await;

    let snapshot = registry.snapshot(&FeedId::Home).await.unwrap();
    assert_eq!(snapshot.items, vec!["pulled"]);
    assert!(!snapshot.connected);
}

#[tokio::test]
async fn hashtag_events_reach_only_matching_feeds() {
    let registry = FeedRegistry::new(EngineConfig::default());
    let router = EventRouter::new(Arc::clone(&registry), MemoryEntityCache::new());

    let rust: FeedId = "hashtag:rust".parse().unwrap();
    let go: FeedId = "hashtag:go".parse().unwrap();
    for feed in [&rust, &go] {
        registry.connect(feed).await;
        router.add_subscription(feed.stream_topic().unwrap(), feed.clone());
    }

    router
        .route(&StreamTopic::with_arg("hashtag", "rust"), PushEvent::Update(item("1")))
        .await;

    assert_eq!(registry.snapshot(&rust).await.unwrap().items, vec!["1"]);
    assert!(registry.snapshot(&go).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn subscribers_see_resync_updates() {
    let registry = connected_home(1, false).await;
    let mut updates = registry.subscribe();

    registry.push_item(&FeedId::Home, &item("a")).await;
    registry.push_item(&FeedId::Home, &item("b")).await;
    registry
        .dequeue(&FeedId::Home, |_| async {
            Ok(PullPage::new(vec![item("fresh")]))
        })
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    assert!(seen.contains(&FeedUpdate::Cleared { feed: FeedId::Home }));
    assert!(seen.contains(&FeedUpdate::Resynced {
        feed: FeedId::Home,
        items: 1
    }));
}
