use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use feedsync::config::Config;
use feedsync::feed::{
    FeedUpdater, HttpFetcher, SkipReason, UpdateMode, UpdateOutcome, UpdateScheduler,
};
use feedsync::storage::{Database, DatabaseError};
use feedsync::util::validate_feed_url;

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Fetch followed feeds and store their entries")]
struct Args {
    /// Config file
    #[arg(long, value_name = "FILE", default_value = "feedsync.toml")]
    config: PathBuf,

    /// Database file (overrides database_path from the config file)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a feed on behalf of a user
    Follow {
        #[arg(long)]
        user: i64,
        url: String,
    },
    /// List followed feeds
    Feeds {
        /// Only feeds followed by this user
        #[arg(long)]
        user: Option<i64>,
    },
    /// Fetch every followed feed and store new entries
    Update {
        /// One feed at a time, in roster order, without retries
        #[arg(long)]
        sequential: bool,
    },
    /// List stored items for a feed
    Items {
        feed_id: i64,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Bookmark a stored item
    Bookmark {
        #[arg(long)]
        user: i64,
        item_id: i64,
    },
    /// List a user's bookmarks
    Bookmarks {
        #[arg(long)]
        user: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    feedsync::logging::init(&config.log_level);

    let db_path = args.db.clone().unwrap_or_else(|| config.database_path());
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: {}", DatabaseError::Locked);
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command {
        Command::Follow { user, url } => {
            let url = validate_feed_url(&url).context("Refusing to follow feed")?;
            let feed_id = db
                .follow_feed(user, url.as_str())
                .await
                .context("Failed to follow feed")?;
            println!("Following {} as feed {}", url, feed_id);
        }
        Command::Feeds { user } => {
            let feeds = match user {
                Some(user) => db.list_feeds_for_user(user).await,
                None => db.list_feeds().await,
            }
            .context("Failed to list feeds")?;
            for feed in feeds {
                println!("{}\t{}\t{}", feed.id, feed.user_id, feed.url);
            }
        }
        Command::Update { sequential } => {
            run_update(&config, db, UpdateMode::from_asynchronous(!sequential)).await?;
        }
        Command::Items { feed_id, limit } => {
            let items = db
                .items_for_feed(feed_id, limit)
                .await
                .context("Failed to list items")?;
            for item in items {
                println!("{}\t{}\t{}", item.id, item.title, item.link);
            }
        }
        Command::Bookmark { user, item_id } => {
            let bookmark_id = db
                .add_bookmark(user, item_id)
                .await
                .context("Failed to add bookmark")?;
            println!("Bookmarked item {} as bookmark {}", item_id, bookmark_id);
        }
        Command::Bookmarks { user } => {
            let bookmarks = db
                .list_bookmarks(user)
                .await
                .context("Failed to list bookmarks")?;
            for bookmark in bookmarks {
                println!(
                    "{}\t{}\t{}",
                    bookmark.id, bookmark.feed_item_id, bookmark.title
                );
            }
        }
    }

    Ok(())
}

/// Run one update cycle and print one line per feed.
///
/// Per-feed failures are reported, not turned into a non-zero exit; only an
/// unreadable roster fails the command.
async fn run_update(config: &Config, db: Database, mode: UpdateMode) -> Result<()> {
    let fetcher = HttpFetcher::with_user_agent(&config.update.user_agent)
        .context("Failed to build HTTP client")?
        .timeout(config.update.fetch_timeout())
        .max_size(config.update.max_feed_size_bytes);

    let db = Arc::new(db);
    let updater = FeedUpdater::new(Arc::new(fetcher), db.clone())
        .with_retry_policy(config.update.retry_policy());
    let scheduler = UpdateScheduler::new(updater).max_concurrency(config.update.max_concurrency);

    // Ctrl-C stops new feeds from starting; in-flight feeds finish on their own
    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight feeds");
            cancel.cancel();
        }
    });

    let report = scheduler.run_cycle(db.as_ref(), mode).await?;

    for (feed_id, outcome) in &report.outcomes {
        println!("{}\t{}", feed_id, outcome);
    }
    println!(
        "{} succeeded ({} entries), {} failed, {} skipped",
        report.succeeded(),
        report.entries(),
        report.failed(),
        report.skipped()
    );

    if report
        .outcomes
        .values()
        .any(|o| matches!(o, UpdateOutcome::Skipped(SkipReason::Cancelled)))
    {
        eprintln!("Update interrupted: some feeds were not started.");
    }

    Ok(())
}
