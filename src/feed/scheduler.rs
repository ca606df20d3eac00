use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use super::sink::FeedRoster;
use super::updater::{FeedUpdater, RetryPolicy, SkipReason, UpdateError, UpdateOutcome};
use crate::storage::Feed;

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// How a cycle walks the roster. Always chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// One task per feed, bounded by the scheduler's concurrency limit, with retries
    Concurrent,
    /// Roster order, one attempt per feed, no backoff
    Sequential,
}

impl UpdateMode {
    pub fn from_asynchronous(asynchronous: bool) -> Self {
        if asynchronous {
            UpdateMode::Concurrent
        } else {
            UpdateMode::Sequential
        }
    }
}

/// Outcome of every feed in one update cycle, keyed by feed ID.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: BTreeMap<i64, UpdateOutcome>,
}

impl CycleReport {
    pub fn get(&self, feed_id: i64) -> Option<&UpdateOutcome> {
        self.outcomes.get(&feed_id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_skipped()).count()
    }

    /// Total entries handed to the sink across all feeds
    pub fn entries(&self) -> usize {
        self.outcomes
            .values()
            .map(|o| match o {
                UpdateOutcome::Succeeded(n) => *n,
                _ => 0,
            })
            .sum()
    }
}

/// Fans a [`FeedUpdater`] out over a roster and collects one outcome per feed.
pub struct UpdateScheduler {
    updater: FeedUpdater,
    max_concurrency: usize,
    cancel: CancellationToken,
}

impl UpdateScheduler {
    pub fn new(updater: FeedUpdater) -> Self {
        Self {
            updater,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    /// Cap on feeds in flight at once in concurrent mode (minimum 1)
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Use an externally owned cancellation token.
    ///
    /// Once cancelled, no new feeds are started; feeds already in flight run
    /// to completion and unstarted feeds are reported as skipped.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read the roster and run one cycle over it.
    ///
    /// # Errors
    ///
    /// Fails only when the roster cannot be read. Per-feed failures are
    /// reported in the returned [`CycleReport`].
    pub async fn run_cycle(&self, roster: &dyn FeedRoster, mode: UpdateMode) -> Result<CycleReport> {
        let feeds = roster
            .list_feeds()
            .await
            .context("Failed to read feed roster")?;
        Ok(self.run(feeds, mode).await)
    }

    /// Run one cycle over `feeds`. Every feed gets exactly one outcome.
    pub async fn run(&self, feeds: Vec<Feed>, mode: UpdateMode) -> CycleReport {
        tracing::info!(feeds = feeds.len(), mode = ?mode, "Starting update cycle");

        let outcomes = match mode {
            UpdateMode::Concurrent => self.run_concurrent(feeds).await,
            UpdateMode::Sequential => self.run_sequential(feeds).await,
        };
        let report = CycleReport {
            outcomes: outcomes.into_iter().collect(),
        };

        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            entries = report.entries(),
            "Update cycle complete"
        );
        report
    }

    async fn run_concurrent(&self, feeds: Vec<Feed>) -> Vec<(i64, UpdateOutcome)> {
        stream::iter(feeds)
            .map(|feed| {
                let updater = self.updater.clone();
                let cancel = self.cancel.clone();

                async move {
                    let feed_id = feed.id;
                    // Checked when buffer_unordered starts this feed, not when the stream is built
                    if cancel.is_cancelled() {
                        return (feed_id, UpdateOutcome::Skipped(SkipReason::Cancelled));
                    }

                    // A separate task per feed keeps a panic in one update from
                    // tearing down the others.
                    let handle = tokio::spawn(async move { updater.update(&feed).await });
                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(feed_id = feed_id, error = %e, "Feed update task aborted");
                            UpdateOutcome::FailedPermanently(UpdateError::Aborted(e.to_string()))
                        }
                    };
                    (feed_id, outcome)
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }

    async fn run_sequential(&self, feeds: Vec<Feed>) -> Vec<(i64, UpdateOutcome)> {
        let policy = RetryPolicy::single_attempt();
        let mut outcomes = Vec::with_capacity(feeds.len());

        for feed in feeds {
            let outcome = if self.cancel.is_cancelled() {
                UpdateOutcome::Skipped(SkipReason::Cancelled)
            } else {
                self.updater.update_with_policy(&feed, policy).await
            };
            outcomes.push((feed.id, outcome));
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::super::fetcher::{ContentFetcher, FetchError, RawFetchResult};
    use super::super::updater::test_support::*;
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn two_items() -> RawFetchResult {
        rss(&[
            ("One", "First", "https://example.com/1"),
            ("Two", "Second", "https://example.com/2"),
        ])
    }

    fn scheduler(fetcher: Arc<dyn ContentFetcher>, sink: &Arc<RecordingSink>) -> UpdateScheduler {
        UpdateScheduler::new(FeedUpdater::new(fetcher, sink.clone()))
    }

    struct FailingRoster;

    #[async_trait]
    impl FeedRoster for FailingRoster {
        async fn list_feeds(&self) -> anyhow::Result<Vec<Feed>> {
            anyhow::bail!("connection refused")
        }
    }

    /// Sleeps on every fetch and tracks how many fetches overlap.
    #[derive(Default)]
    struct SlowFetcher {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl ContentFetcher for SlowFetcher {
        async fn fetch(&self, _url: &str) -> Result<RawFetchResult, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(two_items())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failure_is_isolated() {
        let fetcher = Arc::new(ScriptedFetcher::new(|url, _| {
            if url.ends_with("/broken") {
                Err(FetchError::HttpStatus(500))
            } else {
                Ok(two_items())
            }
        }));
        let sink = Arc::new(RecordingSink::default());

        let report = scheduler(fetcher.clone(), &sink)
            .run(
                vec![feed(1, "https://a/broken"), feed(2, "https://b/rss")],
                UpdateMode::Concurrent,
            )
            .await;

        assert_eq!(report.len(), 2);
        assert!(report.get(1).unwrap().is_failure());
        assert!(matches!(report.get(2), Some(UpdateOutcome::Succeeded(2))));
        assert_eq!(fetcher.calls_for("https://a/broken").len(), 3);
        assert_eq!(sink.appended().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_panic_is_isolated() {
        let fetcher = Arc::new(ScriptedFetcher::new(|url, _| {
            if url.ends_with("/panics") {
                panic!("fetcher bug");
            }
            Ok(two_items())
        }));
        let sink = Arc::new(RecordingSink::default());

        let report = scheduler(fetcher, &sink)
            .run(
                vec![feed(1, "https://a/panics"), feed(2, "https://b/rss")],
                UpdateMode::Concurrent,
            )
            .await;

        match report.get(1) {
            Some(UpdateOutcome::FailedPermanently(e)) => assert_eq!(e.kind(), "aborted"),
            other => panic!("Expected aborted failure, got {:?}", other),
        }
        assert!(report.get(2).unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let fetcher = Arc::new(SlowFetcher::default());
        let sink = Arc::new(RecordingSink::default());
        let feeds: Vec<Feed> = (1..=25)
            .map(|id| feed(id, &format!("https://feeds/{}", id)))
            .collect();

        let report = scheduler(fetcher.clone(), &sink)
            .max_concurrency(3)
            .run(feeds, UpdateMode::Concurrent)
            .await;

        assert_eq!(report.len(), 25);
        assert_eq!(report.succeeded(), 25);
        assert_eq!(report.entries(), 50);
        assert_eq!(fetcher.max_seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_follows_roster_order_without_retry() {
        let fetcher = Arc::new(ScriptedFetcher::new(|url, _| {
            if url.ends_with("/broken") {
                Err(FetchError::HttpStatus(500))
            } else {
                Ok(two_items())
            }
        }));
        let sink = Arc::new(RecordingSink::default());
        let started = Instant::now();

        let report = scheduler(fetcher.clone(), &sink)
            .run(
                vec![
                    feed(3, "https://c/rss"),
                    feed(1, "https://a/broken"),
                    feed(2, "https://b/rss"),
                ],
                UpdateMode::Sequential,
            )
            .await;

        assert_eq!(
            fetcher.urls(),
            vec!["https://c/rss", "https://a/broken", "https://b/rss"]
        );
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(report.get(1).unwrap().is_failure());
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_skips_everything() {
        for mode in [UpdateMode::Concurrent, UpdateMode::Sequential] {
            let fetcher = Arc::new(ScriptedFetcher::new(|_, _| Ok(two_items())));
            let sink = Arc::new(RecordingSink::default());
            let sched = scheduler(fetcher.clone(), &sink);
            sched.cancellation_token().cancel();

            let report = sched
                .run(vec![feed(1, "https://a/rss"), feed(2, "https://b/rss")], mode)
                .await;

            assert_eq!(report.len(), 2, "mode {:?}", mode);
            assert!(report
                .outcomes
                .values()
                .all(|o| matches!(o, UpdateOutcome::Skipped(SkipReason::Cancelled))));
            assert!(fetcher.urls().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_cycle_lets_in_flight_finish() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let fetcher = Arc::new(ScriptedFetcher::new(move |_, _| {
            trigger.cancel();
            Ok(two_items())
        }));
        let sink = Arc::new(RecordingSink::default());

        let report = scheduler(fetcher, &sink)
            .with_cancellation(cancel)
            .run(
                vec![
                    feed(1, "https://a/rss"),
                    feed(2, "https://b/rss"),
                    feed(3, "https://c/rss"),
                ],
                UpdateMode::Sequential,
            )
            .await;

        assert!(report.get(1).unwrap().is_success());
        assert!(matches!(
            report.get(2),
            Some(UpdateOutcome::Skipped(SkipReason::Cancelled))
        ));
        assert!(report.get(3).unwrap().is_skipped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_cycle_concurrent_skips_unstarted() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let fetcher = Arc::new(ScriptedFetcher::new(move |_, _| {
            trigger.cancel();
            Ok(two_items())
        }));
        let sink = Arc::new(RecordingSink::default());
        let feeds: Vec<Feed> = (1..=6)
            .map(|id| feed(id, &format!("https://feed{}.example/rss", id)))
            .collect();

        let report = scheduler(fetcher.clone(), &sink)
            .max_concurrency(2)
            .with_cancellation(cancel)
            .run(feeds, UpdateMode::Concurrent)
            .await;

        // Both feeds already in flight finish; the rest never start
        assert_eq!(report.len(), 6);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.skipped(), 4);
        assert_eq!(fetcher.urls().len(), 2);
        assert_eq!(sink.calls(), 2);
        assert!(report
            .outcomes
            .values()
            .filter(|o| o.is_skipped())
            .all(|o| matches!(o, UpdateOutcome::Skipped(SkipReason::Cancelled))));
    }

    #[tokio::test]
    async fn test_run_cycle_reads_roster() {
        let fetcher = Arc::new(ScriptedFetcher::new(|_, _| Ok(two_items())));
        let sink = Arc::new(RecordingSink::default());
        let roster = vec![feed(7, "https://a/rss")];

        let report = scheduler(fetcher, &sink)
            .run_cycle(&roster, UpdateMode::Concurrent)
            .await
            .unwrap();

        assert!(matches!(report.get(7), Some(UpdateOutcome::Succeeded(2))));
    }

    #[tokio::test]
    async fn test_run_cycle_fails_when_roster_unavailable() {
        let fetcher = Arc::new(ScriptedFetcher::new(|_, _| Ok(two_items())));
        let sink = Arc::new(RecordingSink::default());

        let err = scheduler(fetcher, &sink)
            .run_cycle(&FailingRoster, UpdateMode::Concurrent)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("connection refused"));
    }

    #[tokio::test]
    async fn test_empty_roster() {
        let fetcher = Arc::new(ScriptedFetcher::new(|_, _| Ok(two_items())));
        let sink = Arc::new(RecordingSink::default());

        let report = scheduler(fetcher, &sink)
            .run(Vec::new(), UpdateMode::Concurrent)
            .await;
        assert!(report.is_empty());
    }

    #[test]
    fn test_mode_from_asynchronous_flag() {
        assert_eq!(UpdateMode::from_asynchronous(true), UpdateMode::Concurrent);
        assert_eq!(UpdateMode::from_asynchronous(false), UpdateMode::Sequential);
    }
}
