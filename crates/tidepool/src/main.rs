//! Tidepool: live feed client
//!
//! Main binary with subcommands:
//! - `watch`: Keep feeds live (pull, streaming, dequeue) and log changes
//! - `pull`: Page through a feed once and print its items
//! - `inspect`: Show how a feed id maps to its pull resource and topic

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tidepool_feeds::{
    AcceptAll, AcceptPolicy, ColumnFilter, EngineConfig, FeedId, FeedSyncBuilder, HttpPager,
};

mod watch;

#[derive(Parser)]
#[command(name = "tidepool")]
#[command(about = "Live feed client for Mastodon-compatible servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Column filter flags shared by subcommands.
#[derive(clap::Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Hide replies to other accounts
    #[arg(long)]
    hide_replies: bool,

    /// Hide boosts
    #[arg(long)]
    hide_reblogs: bool,

    /// Hide items whose text matches this regex (case-insensitive)
    #[arg(long, value_name = "REGEX")]
    hide_matching: Option<String>,
}

impl FilterArgs {
    fn policy(&self) -> Arc<dyn AcceptPolicy> {
        if !self.hide_replies && !self.hide_reblogs && self.hide_matching.is_none() {
            return Arc::new(AcceptAll);
        }
        let mut filter = ColumnFilter::new()
            .hide_replies(self.hide_replies)
            .hide_reblogs(self.hide_reblogs);
        if let Some(pattern) = &self.hide_matching {
            filter = filter.body_regex(pattern);
        }
        Arc::new(filter)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Keep feeds live and log every change
    Watch {
        /// Server base URL
        #[arg(long, env = "TIDEPOOL_SERVER")]
        server: String,

        /// Access token
        #[arg(long, env = "TIDEPOOL_TOKEN")]
        token: Option<String>,

        /// Feeds to watch (e.g. home, public:local, hashtag:rust, notifications)
        #[arg(long = "feed", default_value = "home")]
        feeds: Vec<String>,

        /// Streaming endpoint (defaults to <server>/api/v1/streaming)
        #[arg(long, env = "TIDEPOOL_STREAMING_URL")]
        streaming_url: Option<String>,

        /// Pending queue cap per feed
        #[arg(long, env = "TIDEPOOL_MAX_QUEUED", default_value = "40")]
        max_queued: usize,

        /// Auto-flush interval in seconds for feeds at the top (0 disables)
        #[arg(long, env = "TIDEPOOL_DEQUEUE_INTERVAL", default_value = "5")]
        dequeue_interval: u64,

        /// Treat feeds as scrolled away from the top, so pushes are queued
        /// until SIGUSR1 flushes them
        #[arg(long)]
        scrolled: bool,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Page through a feed and print its items as JSON lines
    Pull {
        /// Server base URL
        #[arg(long, env = "TIDEPOOL_SERVER")]
        server: String,

        /// Access token
        #[arg(long, env = "TIDEPOOL_TOKEN")]
        token: Option<String>,

        /// Feed to pull
        #[arg(default_value = "home")]
        feed: String,

        /// Number of pages to load
        #[arg(long, default_value = "1")]
        pages: u32,

        /// Items per page
        #[arg(long, env = "TIDEPOOL_PAGE_LIMIT", default_value = "20")]
        limit: u32,
    },

    /// Show the pull resource and streaming topic of a feed id
    Inspect {
        /// Feed id
        feed: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tidepool=info,tidepool_feeds=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            server,
            token,
            feeds,
            streaming_url,
            max_queued,
            dequeue_interval,
            scrolled,
            filter,
        } => {
            let feeds = parse_feeds(&feeds)?;
            let mut config = EngineConfig {
                max_queued_timeline: max_queued,
                max_queued_notifications: max_queued,
                max_queued_chat: max_queued,
                ..EngineConfig::default()
            };
            if dequeue_interval > 0 {
                config = config.with_dequeue_interval(Duration::from_secs(dequeue_interval));
            }
            if let Some(url) = streaming_url {
                config = config.with_streaming_url(url);
            }
            watch::run(watch::WatchOptions {
                server,
                token,
                feeds,
                config,
                at_top: !scrolled,
                policy: filter.policy(),
            })
            .await
        }

        Commands::Pull {
            server,
            token,
            feed,
            pages,
            limit,
        } => run_pull(&server, token, &feed, pages, limit).await,

        Commands::Inspect { feed } => run_inspect(&feed),
    }
}

fn parse_feeds(feeds: &[String]) -> Result<Vec<FeedId>> {
    feeds
        .iter()
        .map(|f| f.parse::<FeedId>().map_err(|e| miette::miette!("{}", e)))
        .collect()
}

fn http_pager(server: &str, token: Option<String>) -> HttpPager {
    let pager = HttpPager::new(server);
    match token {
        Some(token) => pager.with_access_token(token),
        None => pager,
    }
}

async fn run_pull(server: &str, token: Option<String>, feed: &str, pages: u32, limit: u32) -> Result<()> {
    let feed: FeedId = feed.parse().map_err(|e| miette::miette!("{}", e))?;
    let sync = FeedSyncBuilder::new(Arc::new(http_pager(server, token)))
        .page_limit(limit)
        .build();

    for page in 0..pages.max(1) {
        let applied = sync
            .expand(&feed)
            .await
            .map_err(|e| miette::miette!("failed to pull page {}: {}", page + 1, e))?;
        if applied.is_none() {
            break;
        }
    }

    let registry = sync.registry();
    let snapshot = registry
        .snapshot(&feed)
        .await
        .ok_or_else(|| miette::miette!("feed {} was never loaded", feed))?;
    let cache = sync.cache();
    for id in &snapshot.items {
        if let Some(item) = cache.get(id) {
            let line = serde_json::to_string(&item).map_err(|e| miette::miette!("{}", e))?;
            println!("{}", line);
        }
    }

    tracing::info!(
        feed = %feed,
        items = snapshot.items.len(),
        backfill = ?snapshot.backfill,
        "pull finished"
    );
    Ok(())
}

fn run_inspect(feed: &str) -> Result<()> {
    let feed: FeedId = feed.parse().map_err(|e| miette::miette!("{}", e))?;
    let resource = feed.resource();
    let query: Vec<String> = resource
        .query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    println!("feed:     {}", feed);
    println!("kind:     {:?}", feed.kind());
    if query.is_empty() {
        println!("resource: {}", resource.path);
    } else {
        println!("resource: {}?{}", resource.path, query.join("&"));
    }
    match feed.stream_topic() {
        Some(topic) => println!(
            "topic:    {} (subscribe: {})",
            topic,
            topic.control_message("subscribe")
        ),
        None => println!("topic:    none (pull only)"),
    }
    Ok(())
}
