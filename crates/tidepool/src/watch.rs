//! Watch command: keeps a set of feeds live.
//!
//! The command runs four cooperating tasks:
//! - Streaming client (routes pushed events into feeds)
//! - Dequeue scheduler (auto-flushes feeds at the top)
//! - Flush listener (SIGUSR1 shows every queued item, even when scrolled)
//! - Update logger (reports every feed change)
//!
//! When the stream reconnects, connected feeds are refreshed so that
//! anything missed while offline is pulled in.

use std::sync::Arc;

use miette::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use tidepool_feeds::{
    AcceptPolicy, DequeueHandle, DequeueScheduler, EngineConfig, EventRouter, FeedId, FeedRegistry,
    FeedSync, FeedSyncBuilder, FeedUpdate, HttpPager, MemoryEntityCache, StreamStatus,
    StreamingClient,
};

/// Options for the watch command.
pub struct WatchOptions {
    pub server: String,
    pub token: Option<String>,
    pub feeds: Vec<FeedId>,
    pub config: EngineConfig,
    /// Whether feeds start scrolled to the top.
    pub at_top: bool,
    pub policy: Arc<dyn AcceptPolicy>,
}

/// Run the watch loop until ctrl-c.
pub async fn run(options: WatchOptions) -> Result<()> {
    let WatchOptions {
        server,
        token,
        feeds,
        config,
        at_top,
        policy,
    } = options;

    info!(server = %server, feeds = feeds.len(), "starting watch");

    let registry = FeedRegistry::new(config.clone());
    let router = EventRouter::new(Arc::clone(&registry), MemoryEntityCache::new());

    let streaming_url = config.streaming_url_for(&server);
    let (client, stream) = StreamingClient::new(streaming_url, Arc::clone(&router));
    let mut pager = HttpPager::new(&server);
    let client = match token {
        Some(token) => {
            pager = pager.with_access_token(token.clone());
            client.with_access_token(token)
        }
        None => client,
    };
    let client = Arc::new(client);

    let sync = Arc::new(
        FeedSyncBuilder::new(Arc::new(pager))
            .config(config.clone())
            .registry(Arc::clone(&registry))
            .router(Arc::clone(&router))
            .stream(stream)
            .page_limit(config.page_limit)
            .build(),
    );

    // Subscribe before any feed is touched so no update is missed.
    let updates = registry.subscribe();

    for feed in &feeds {
        let feed_config = config
            .feed_config(feed.kind())
            .with_shared_policy(Arc::clone(&policy))
            .at_top(at_top);
        registry.configure(feed, feed_config).await;
        sync.connect(feed).await;
        if let Err(e) = sync.refresh(feed).await {
            warn!(feed = %feed, error = %e, "initial pull failed");
        }
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let stream_handle = {
        let client = Arc::clone(&client);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = client.run(shutdown_rx).await {
                error!(error = %e, "streaming client stopped");
            }
        })
    };

    let (scheduler, dequeue) = DequeueScheduler::new(Arc::clone(&sync));
    let scheduler_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let flush_handle = tokio::spawn(flush_on_signal(
        dequeue,
        feeds.clone(),
        shutdown_rx.clone(),
    ));

    let reconnect_handle = tokio::spawn(refresh_on_reconnect(
        Arc::clone(&sync),
        client.status(),
        shutdown_rx.clone(),
    ));

    let logger_handle = tokio::spawn(log_updates(
        Arc::clone(&registry),
        updates,
        shutdown_rx.clone(),
    ));

    // Wait for shutdown signal
    let mut main_shutdown_rx = shutdown_rx.clone();
    loop {
        if main_shutdown_rx.changed().await.is_err() || *main_shutdown_rx.borrow() {
            break;
        }
    }

    info!("shutting down watch");
    for feed in &feeds {
        sync.disconnect(feed).await;
    }

    let _ = stream_handle.await;
    let _ = scheduler_handle.await;
    let _ = flush_handle.await;
    let _ = reconnect_handle.await;
    let _ = logger_handle.await;

    info!("watch stopped");
    Ok(())
}

/// Refresh connected feeds each time the stream comes back after a drop.
async fn refresh_on_reconnect(
    sync: Arc<FeedSync>,
    mut status_rx: watch::Receiver<StreamStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // The first connection follows the initial pull, so only later ones refresh.
    let mut connections = 0usize;
    let mut online = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            result = status_rx.changed() => {
                if result.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                match status {
                    StreamStatus::Connected if !online => {
                        online = true;
                        connections += 1;
                        if connections > 1 {
                            info!(connections, "stream reconnected, refreshing feeds");
                            sync.refresh_connected().await;
                        }
                    }
                    StreamStatus::Disconnected if online => {
                        online = false;
                        warn!("stream disconnected, feeds will refresh on reconnect");
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Request a flush of every watched feed on each SIGUSR1.
#[cfg(unix)]
pub(crate) async fn flush_on_signal(
    dequeue: DequeueHandle,
    feeds: Vec<FeedId>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut flush_signal = match signal(SignalKind::user_defined1()) {
        Ok(flush_signal) => flush_signal,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGUSR1, manual flush disabled");
            return;
        }
    };
    info!("send SIGUSR1 to show queued items");

    loop {
        tokio::select! {
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            received = flush_signal.recv() => {
                if received.is_none() {
                    break;
                }
                debug!(feeds = feeds.len(), "manual flush requested");
                for feed in &feeds {
                    if !dequeue.request(feed.clone()).await {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn flush_on_signal(
    _dequeue: DequeueHandle,
    _feeds: Vec<FeedId>,
    _shutdown_rx: watch::Receiver<bool>,
) {
    debug!("manual flush needs SIGUSR1, unavailable on this platform");
}

/// Log feed changes until shutdown.
async fn log_updates(
    registry: Arc<FeedRegistry>,
    mut updates: broadcast::Receiver<FeedUpdate>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            update = updates.recv() => match update {
                Ok(update) => log_update(&registry, update).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "update logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn log_update(registry: &FeedRegistry, update: FeedUpdate) {
    match update {
        FeedUpdate::ItemsChanged { feed } => {
            if let Some(snapshot) = registry.snapshot(&feed).await {
                info!(
                    feed = %feed,
                    items = snapshot.items.len(),
                    newest = snapshot.items.first().map(String::as_str).unwrap_or("-"),
                    "items changed"
                );
            }
        }
        FeedUpdate::Queued { feed, total_queued } => {
            info!(feed = %feed, total_queued, "new items waiting");
        }
        FeedUpdate::Resynced { feed, items } => {
            info!(feed = %feed, items, "feed resynced after overflow");
        }
        FeedUpdate::Cleared { feed } => info!(feed = %feed, "feed cleared"),
        FeedUpdate::LoadingChanged { feed, loading } => {
            debug!(feed = %feed, loading, "loading changed");
        }
        FeedUpdate::ConnectionChanged { feed, connected } => {
            info!(feed = %feed, connected, "connection changed");
        }
    }
}
