use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The feed database is locked by another process. Please try again.")]
    Locked,

    /// Table creation failed
    #[error("Database setup failed: {0}")]
    Setup(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error, mapping SQLite lock conditions to [`DatabaseError::Locked`]
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::Locked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as lock messages
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Data Structures
// ============================================================================

/// A followed feed, as read from the roster at the start of an update cycle.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    /// Owning user. Opaque to the update pipeline.
    pub user_id: i64,
}

/// One item extracted from a feed, ready to be appended to storage.
///
/// `title` and `description` may be empty. Entries with an empty `link`
/// never reach the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEntry {
    pub title: String,
    pub description: String,
    pub link: String,
}

impl NormalizedEntry {
    pub fn has_link(&self) -> bool {
        !self.link.trim().is_empty()
    }
}

/// A stored feed item
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedItem {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub description: String,
    pub link: String,
    pub fetched_at: i64,
}

/// A user's bookmark, joined with the bookmarked item's title
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Bookmark {
    pub id: i64,
    pub feed_item_id: i64,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_messages_detected() {
        assert!(is_lock_message("error returned from database: database is locked"));
        assert!(is_lock_message("SQLITE_BUSY"));
        assert!(!is_lock_message("no such table: feeds"));
    }

    #[test]
    fn test_entry_without_link() {
        let entry = NormalizedEntry {
            title: "t".into(),
            description: String::new(),
            link: "   ".into(),
        };
        assert!(!entry.has_link());
    }
}
