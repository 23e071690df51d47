//! ConversationStore trait — the durable conversation log capability.
//!
//! An append-only message log keyed by conversation id, plus conversation
//! metadata (title, timestamps). The store is the only cross-request shared
//! mutable resource in the system; all writes are appends or single-row
//! updates, so no conversation-level locking is needed beyond what the
//! backend guarantees.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::turn::{ConversationId, ConversationMeta, Turn};

/// Durable conversation storage.
///
/// Ordering guarantee: within one conversation, appended turns are strictly
/// ordered; across conversations there is no ordering guarantee.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// A human-readable name for this backend (e.g. "sqlite").
    fn name(&self) -> &str;

    /// Create a conversation with the given title.
    async fn create_conversation(
        &self,
        title: &str,
    ) -> std::result::Result<ConversationMeta, StoreError>;

    /// Fetch metadata for one conversation.
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> std::result::Result<Option<ConversationMeta>, StoreError>;

    /// List all conversations, most recently updated first.
    async fn list_conversations(&self) -> std::result::Result<Vec<ConversationMeta>, StoreError>;

    /// Delete a conversation and its message log. Returns whether it existed.
    async fn delete_conversation(
        &self,
        id: &ConversationId,
    ) -> std::result::Result<bool, StoreError>;

    /// Replace a conversation's title (used once, when the first message of
    /// an empty conversation arrives).
    async fn set_title(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> std::result::Result<(), StoreError>;

    /// Append a turn to the conversation's log and refresh `updated_at`.
    async fn append_turn(
        &self,
        id: &ConversationId,
        turn: &Turn,
    ) -> std::result::Result<(), StoreError>;

    /// The conversation's message log, in append order.
    async fn list_turns(&self, id: &ConversationId)
        -> std::result::Result<Vec<Turn>, StoreError>;

    /// Clear the message log but keep the conversation metadata.
    async fn clear_turns(&self, id: &ConversationId) -> std::result::Result<(), StoreError>;
}
