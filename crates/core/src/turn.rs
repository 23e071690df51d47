//! Turn and Conversation domain types.
//!
//! These are the value objects that flow through the whole system:
//! a client sends a message → the controller assembles a prompt from prior
//! turns → the engine streams a reply → both turns land in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The author of a turn.
///
/// Deliberately closed: only the two roles the prompt template can render.
/// An unknown role string fails deserialization at the edge instead of
/// being silently dropped somewhere in the middle of prompt assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model's reply
    Assistant,
}

impl Role {
    /// Wire-format tag used in the prompt template and the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a stored role tag. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who authored this turn
    pub role: Role,

    /// The text content
    pub content: String,
}

impl Turn {
    /// Create a new user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create a new assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Maximum title length derived from the first user message.
pub const TITLE_MAX_CHARS: usize = 50;

/// Placeholder title for conversations created before any message exists.
/// A conversation still carrying it gets a derived title on its first
/// message; any other title is considered final.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Derive a conversation title from its first user message.
///
/// The first 50 characters, with an ellipsis marker when the message is
/// longer. Derived exactly once per conversation.
pub fn derive_title(first_message: &str) -> String {
    let mut chars = first_message.chars();
    let title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{title}…")
    } else {
        title
    }
}

/// Conversation metadata as stored durably. The message log itself is
/// accessed separately through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Title derived from the first user message
    pub title: String,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// Refreshed on every appended turn
    pub updated_at: DateTime<Utc>,
}

impl ConversationMeta {
    /// Create metadata for a fresh conversation.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
