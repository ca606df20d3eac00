mod bookmarks;
mod feeds;
mod items;
mod schema;
mod types;

pub use schema::Database;
pub use types::{Bookmark, DatabaseError, Feed, FeedItem, NormalizedEntry};
