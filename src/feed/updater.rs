use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::fetcher::{ContentFetcher, FetchError};
use super::parser::{self, ParseError};
use super::sink::EntrySink;
use crate::storage::{Feed, NormalizedEntry};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Outcomes
// ============================================================================

/// Why a single feed update attempt failed.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The sink rejected the entries
    #[error("Persistence error: {0}")]
    Persistence(String),
    /// The task driving the update panicked or was aborted
    #[error("Update task aborted: {0}")]
    Aborted(String),
}

impl UpdateError {
    /// Short, stable name of the error category, for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Fetch(_) => "fetch",
            UpdateError::Parse(ParseError::UnsupportedContentKind { .. }) => {
                "unsupported-content-kind"
            }
            UpdateError::Parse(_) => "parse",
            UpdateError::Persistence(_) => "persistence",
            UpdateError::Aborted(_) => "aborted",
        }
    }

    /// A truncated response can look malformed, so parse errors are retried
    /// along with fetch and persistence errors.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            UpdateError::Parse(ParseError::UnsupportedContentKind { .. })
                | UpdateError::Aborted(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The feed parsed cleanly but had no entries with a link
    NoEntries,
    /// The cycle was cancelled before this feed was started
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NoEntries => "no entries found",
            SkipReason::Cancelled => "cycle cancelled",
        })
    }
}

/// Terminal result of updating one feed in one cycle.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// Number of entries handed to the sink
    Succeeded(usize),
    /// The last error seen before giving up
    FailedPermanently(UpdateError),
    Skipped(SkipReason),
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Succeeded(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, UpdateOutcome::FailedPermanently(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, UpdateOutcome::Skipped(_))
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOutcome::Succeeded(n) => write!(f, "succeeded ({} entries)", n),
            UpdateOutcome::FailedPermanently(e) => write!(f, "failed [{}]: {}", e.kind(), e),
            UpdateOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
        }
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Attempt budget and exponential backoff for one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// One attempt, no backoff.
    pub fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before retry `retry` (1 = before the second attempt): `base * 2^(retry-1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(retry - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

// ============================================================================
// Feed Updater
// ============================================================================

/// Drives fetch → parse → persist for one feed, retrying the whole sequence.
///
/// Cheap to clone: the fetcher and sink are shared.
#[derive(Clone)]
pub struct FeedUpdater {
    fetcher: Arc<dyn ContentFetcher>,
    sink: Arc<dyn EntrySink>,
    retry: RetryPolicy,
}

impl FeedUpdater {
    pub fn new(fetcher: Arc<dyn ContentFetcher>, sink: Arc<dyn EntrySink>) -> Self {
        Self {
            fetcher,
            sink,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Update one feed using the configured retry policy.
    ///
    /// Never fails: every error path resolves to an [`UpdateOutcome`].
    /// Entries written by an attempt that later fails are not rolled back,
    /// and the retry writes them again.
    pub async fn update(&self, feed: &Feed) -> UpdateOutcome {
        self.update_with_policy(feed, self.retry).await
    }

    pub async fn update_with_policy(&self, feed: &Feed, policy: RetryPolicy) -> UpdateOutcome {
        let mut attempt = 1;

        loop {
            let error = match self.attempt(feed).await {
                Ok(0) => {
                    tracing::debug!(feed_id = feed.id, url = %feed.url, "No entries found");
                    return UpdateOutcome::Skipped(SkipReason::NoEntries);
                }
                Ok(count) => {
                    tracing::info!(
                        feed_id = feed.id,
                        url = %feed.url,
                        entries = count,
                        attempt = attempt,
                        "Feed updated"
                    );
                    return UpdateOutcome::Succeeded(count);
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= policy.max_attempts {
                tracing::warn!(
                    feed_id = feed.id,
                    url = %feed.url,
                    attempts = attempt,
                    kind = error.kind(),
                    error = %error,
                    "Feed update failed permanently"
                );
                return UpdateOutcome::FailedPermanently(error);
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                feed_id = feed.id,
                url = %feed.url,
                attempt = attempt,
                delay_ms = saturating_millis(delay),
                error = %error,
                "Feed update failed, retrying after delay"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One pass of fetch → parse → persist. Returns the number of entries persisted.
    async fn attempt(&self, feed: &Feed) -> Result<usize, UpdateError> {
        let raw = self.fetcher.fetch(&feed.url).await?;
        let parsed = parser::parse(raw)?;
        let total = parsed.len();

        let entries: Vec<NormalizedEntry> = parsed.filter(NormalizedEntry::has_link).collect();
        if entries.len() < total {
            tracing::warn!(
                feed_id = feed.id,
                url = %feed.url,
                dropped = total - entries.len(),
                "Entries without a link skipped"
            );
        }
        if entries.is_empty() {
            return Ok(0);
        }

        let count = entries.len();
        self.sink
            .append_entries(feed.id, entries)
            .await
            .map_err(|e| UpdateError::Persistence(format!("{:#}", e)))?;
        Ok(count)
    }
}

/// Whole milliseconds in `delay`, clamped to `u64::MAX` for saturated backoffs.
fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
