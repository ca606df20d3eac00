use anyhow::Result;
use async_trait::async_trait;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{FeedItem, NormalizedEntry};
use crate::feed::EntrySink;

/// Maximum number of items to return from any single query
const MAX_ITEMS: i64 = 2000;

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Append entries for a feed in one transaction, returning the number written.
    ///
    /// Entries are not deduplicated: appending the same entries twice stores
    /// them twice. Batches of 100 stay under SQLite's parameter limit
    /// (5 columns * 100 = 500).
    pub async fn append_items(&self, feed_id: i64, entries: &[NormalizedEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 100;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for chunk in entries.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO feed_items (feed_id, title, description, link, fetched_at) ",
            );
            builder.push_values(chunk, |mut b, entry| {
                b.push_bind(feed_id)
                    .push_bind(&entry.title)
                    .push_bind(&entry.description)
                    .push_bind(&entry.link)
                    .push_bind(now);
            });
            let result = builder.build().execute(&mut *tx).await?;
            written += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Items for a feed, newest first. `limit` defaults to 500 and is capped at 2000.
    pub async fn items_for_feed(&self, feed_id: i64, limit: Option<i64>) -> Result<Vec<FeedItem>> {
        let limit = limit.unwrap_or(500).clamp(1, MAX_ITEMS);
        let items = sqlx::query_as::<_, FeedItem>(
            r#"
            SELECT id, feed_id, title, description, link, fetched_at
            FROM feed_items
            WHERE feed_id = ?
            ORDER BY fetched_at DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }
}

#[async_trait]
impl EntrySink for Database {
    async fn append_entries(&self, feed_id: i64, entries: Vec<NormalizedEntry>) -> Result<()> {
        let written = self.append_items(feed_id, &entries).await?;
        tracing::debug!(feed_id = feed_id, written = written, "Appended feed items");
        Ok(())
    }
}
