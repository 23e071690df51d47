//! Wire events emitted over the chat stream.
//!
//! Each event serializes to a bare JSON object with no type tag; clients
//! dispatch on which keys are present. Variant order matters for
//! deserialization: `Done` carries a `conversation_id` too, so it must be
//! tried before `Conversation`.

use serde::{Deserialize, Serialize};

/// One frame of the chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    /// Terminal success frame, with metering for the whole response.
    Done {
        /// Always `true`.
        done: bool,
        /// Fragments streamed for this response.
        total_tokens: usize,
        /// Throughput measured from the first fragment. `0.0` when the
        /// response finished within one clock tick.
        tokens_per_second: f64,
        /// The conversation this response belongs to.
        conversation_id: String,
        /// Set when the response streamed fully but could not be written to
        /// the conversation log.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        history_sync_failed: bool,
    },

    /// Announces the server-assigned conversation id for a request that did
    /// not carry one.
    Conversation { conversation_id: String },

    /// One text fragment of the response, in generation order.
    Token { token: String },

    /// Terminal failure after streaming has started. No `Done` follows.
    Error { error: String },
}

impl StreamEvent {
    pub fn token(fragment: impl Into<String>) -> Self {
        Self::Token {
            token: fragment.into(),
        }
    }

    pub fn conversation(id: impl Into<String>) -> Self {
        Self::Conversation {
            conversation_id: id.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn done(
        total_tokens: usize,
        tokens_per_second: f64,
        conversation_id: impl Into<String>,
        history_sync_failed: bool,
    ) -> Self {
        Self::Done {
            done: true,
            total_tokens,
            tokens_per_second,
            conversation_id: conversation_id.into(),
            history_sync_failed,
        }
    }
}
