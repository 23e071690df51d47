//! Error types for the chatspan domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; there is deliberately no
//! aggregate error type — callers handle the context they talk to, and the
//! binary edge boxes whatever reaches it.

use thiserror::Error;

/// Failures of the generation capability.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Engine not configured: {0}")]
    NotConfigured(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures of the durable conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Conversation not found: {0}")]
    NotFound(String),
}

/// Failures of context-window budgeting.
///
/// These are validation-class: detected before any generation compute or
/// store write happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The assembled prompt plus the reserved margin already exceed the
    /// context window — there is no room left for a response.
    #[error(
        "Prompt ({prompt_tokens} tokens) plus reserved margin ({reserved_margin}) \
         exceeds the context window ({window_capacity} tokens)"
    )]
    Overflow {
        prompt_tokens: usize,
        window_capacity: usize,
        reserved_margin: usize,
    },
}
