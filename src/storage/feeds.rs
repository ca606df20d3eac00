use anyhow::Result;
use async_trait::async_trait;

use super::schema::Database;
use super::types::Feed;
use crate::feed::FeedRoster;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Follow a feed on behalf of a user, returning the new feed ID.
    ///
    /// The URL is stored as given; callers validate it first.
    pub async fn follow_feed(&self, user_id: i64, url: &str) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("INSERT INTO feeds (url, user_id) VALUES (?, ?) RETURNING id")
                .bind(url)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Every followed feed, in ID order. This is the update roster.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT id, url, user_id FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    /// Feeds followed by one user, in ID order
    pub async fn list_feeds_for_user(&self, user_id: i64) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            "SELECT id, url, user_id FROM feeds WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }
}

#[async_trait]
impl FeedRoster for Database {
    async fn list_feeds(&self) -> Result<Vec<Feed>> {
        Database::list_feeds(self).await
    }
}
