//! SQLite conversation store.
//!
//! Two tables in one database file:
//! - `conversations` — metadata (title, timestamps)
//! - `messages` — the append-only turn log, ordered by integer rowid
//!
//! Deleting a conversation cascades to its messages.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

use chatspan_core::error::StoreError;
use chatspan_core::store::ConversationStore;
use chatspan_core::turn::{ConversationId, ConversationMeta, Role, Turn};

/// A production SQLite conversation store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// Pass `":memory:"` for an in-process ephemeral database (useful for
    /// tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite conversation store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id         TEXT PRIMARY KEY,
                title      TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                iid             INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL
                                REFERENCES conversations(id) ON DELETE CASCADE,
                role            TEXT NOT NULL,
                content         TEXT NOT NULL,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, iid)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
             ON conversations(updated_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("conversations index: {e}")))?;

        Ok(())
    }
}

/// Fixed-precision RFC 3339 so text comparison in `ORDER BY` matches
/// chronological order.
fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("Bad timestamp '{raw}': {e}")))
}

fn row_to_meta(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationMeta, StoreError> {
    Ok(ConversationMeta {
        id: ConversationId(row.get("id")),
        title: row.get("title"),
        created_at: parse_timestamp(row.get("created_at"))?,
        updated_at: parse_timestamp(row.get("updated_at"))?,
    })
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, StoreError> {
    let role_tag: String = row.get("role");
    let role = Role::parse(&role_tag)
        .ok_or_else(|| StoreError::QueryFailed(format!("Unknown role tag '{role_tag}'")))?;
    Ok(Turn {
        role,
        content: row.get("content"),
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_conversation(&self, title: &str) -> Result<ConversationMeta, StoreError> {
        let meta = ConversationMeta::new(title);
        sqlx::query(
            "INSERT INTO conversations (id, title, created_at, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(meta.id.to_string())
        .bind(&meta.title)
        .bind(format_timestamp(meta.created_at))
        .bind(format_timestamp(meta.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Insert conversation: {e}")))?;

        debug!(id = %meta.id, "Created conversation");
        Ok(meta)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationMeta>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Fetch conversation: {e}")))?;

        row.as_ref().map(row_to_meta).transpose()
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationMeta>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM conversations
             ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("List conversations: {e}")))?;

        rows.iter().map(row_to_meta).collect()
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Delete conversation: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_title(&self, id: &ConversationId, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Set title: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn append_turn(&self, id: &ConversationId, turn: &Turn) -> Result<(), StoreError> {
        let now = format_timestamp(Utc::now());
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Begin append: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, created_at)
             SELECT id, ?, ?, ? FROM conversations WHERE id = ?",
        )
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(&now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Insert message: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Touch conversation: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Commit append: {e}")))?;
        Ok(())
    }

    async fn list_turns(&self, id: &ConversationId) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            "SELECT role, content FROM messages WHERE conversation_id = ? ORDER BY iid",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("List messages: {e}")))?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn clear_turns(&self, id: &ConversationId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Clear messages: {e}")))?;
        Ok(())
    }
}
