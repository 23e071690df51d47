//! Durable conversation storage backed by SQLite.

pub mod sqlite;

pub use sqlite::SqliteStore;
