//! Feed update pipeline: fetch, parse, and persist entries for every followed feed.
//!
//! - [`fetcher`] - one HTTP fetch per call, content kind taken from `Content-Type`
//! - [`parser`] - RSS/Atom (via `feed-rs`) and the JSON domain-listing adapter
//! - [`updater`] - fetch → parse → persist for one feed, with exponential backoff
//! - [`scheduler`] - fans updates out over the roster, concurrently or in order
//!
//! Persistence and the roster are injected through [`EntrySink`] and [`FeedRoster`].
//!
//! # Example
//!
//! ```ignore
//! use feedsync::feed::{FeedUpdater, HttpFetcher, UpdateMode, UpdateScheduler};
//!
//! let db = Arc::new(Database::open("feeds.db").await?);
//! let fetcher = Arc::new(HttpFetcher::new(reqwest::Client::new()));
//! let scheduler = UpdateScheduler::new(FeedUpdater::new(fetcher, db.clone()));
//! let report = scheduler.run_cycle(db.as_ref(), UpdateMode::Concurrent).await?;
//! ```

mod fetcher;
mod parser;
mod scheduler;
mod sink;
mod updater;

pub use fetcher::{
    ContentFetcher, ContentKind, FetchError, HttpFetcher, RawFetchResult, DEFAULT_FETCH_TIMEOUT,
    DEFAULT_MAX_FEED_SIZE,
};
pub use parser::{parse, Entries, ParseError};
pub use scheduler::{CycleReport, UpdateMode, UpdateScheduler, DEFAULT_MAX_CONCURRENCY};
pub use sink::{EntrySink, FeedRoster};
pub use updater::{
    FeedUpdater, RetryPolicy, SkipReason, UpdateError, UpdateOutcome, DEFAULT_BASE_DELAY,
    DEFAULT_MAX_RETRIES,
};
