use anyhow::Result;

use super::schema::Database;
use super::types::Bookmark;

impl Database {
    // ========================================================================
    // Bookmark Operations
    // ========================================================================

    /// Bookmark a stored item for a user, returning the bookmark ID
    pub async fn add_bookmark(&self, user_id: i64, feed_item_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO bookmarks (user_id, feed_item_id) VALUES (?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(feed_item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// A user's bookmarks with the bookmarked item's title, oldest first
    pub async fn list_bookmarks(&self, user_id: i64) -> Result<Vec<Bookmark>> {
        let bookmarks = sqlx::query_as::<_, Bookmark>(
            r#"
            SELECT b.id, b.feed_item_id, i.title
            FROM bookmarks b
            JOIN feed_items i ON i.id = b.feed_item_id
            WHERE b.user_id = ?
            ORDER BY b.id
        "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookmarks)
    }
}
