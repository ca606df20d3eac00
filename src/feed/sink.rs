use anyhow::Result;
use async_trait::async_trait;

use crate::storage::{Feed, NormalizedEntry};

/// Source of the feed roster read at the start of each update cycle.
#[async_trait]
pub trait FeedRoster: Send + Sync {
    async fn list_feeds(&self) -> Result<Vec<Feed>>;
}

/// A fixed roster, for callers that already hold the feed list.
#[async_trait]
impl FeedRoster for Vec<Feed> {
    async fn list_feeds(&self) -> Result<Vec<Feed>> {
        Ok(self.clone())
    }
}

/// Durable append of normalized entries for a feed.
///
/// Implementations must tolerate concurrent calls for different feeds.
/// Calls are not idempotent: a retried update may append the same entries again.
#[async_trait]
pub trait EntrySink: Send + Sync {
    async fn append_entries(&self, feed_id: i64, entries: Vec<NormalizedEntry>) -> Result<()>;
}
