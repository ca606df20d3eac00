//! feedsync: fetch RSS/Atom feeds and JSON listings concurrently, normalize
//! their entries, and append them to a SQLite store.
//!
//! The update pipeline lives in [`feed`]; [`storage`] provides the SQLite
//! roster and sink it runs against.

pub mod config;
pub mod feed;
pub mod logging;
pub mod storage;
pub mod util;
