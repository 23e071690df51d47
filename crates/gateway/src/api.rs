//! REST + SSE API.
//!
//! Endpoints:
//!
//! - `POST   /api/chat`                        — Send a message, get SSE stream
//! - `GET    /api/conversations`               — List conversations
//! - `POST   /api/conversations`               — Create a conversation
//! - `DELETE /api/conversations/{id}`          — Delete a conversation
//! - `GET    /api/conversations/{id}/messages` — The conversation's message log
//! - `DELETE /api/conversations/{id}/messages` — Clear the log, keep the conversation

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use chatspan_core::error::StoreError;
use chatspan_core::turn::{ConversationId, ConversationMeta, Turn, DEFAULT_TITLE};
use chatspan_session::{ChatError, ChatRequest, SamplingOverrides};

use crate::SharedState;

/// Build the API router. Nest this under "/api" in the main router.
pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route(
            "/conversations",
            get(list_conversations_handler).post(create_conversation_handler),
        )
        .route("/conversations/{id}", delete(delete_conversation_handler))
        .route(
            "/conversations/{id}/messages",
            get(list_messages_handler).delete(clear_messages_handler),
        )
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatBody {
    /// The user's message.
    message: String,
    /// Existing conversation ID (omit to create a new one).
    #[serde(default)]
    conversation_id: Option<String>,
    /// Inline history for requests without a conversation id. Prompt-only:
    /// it is not persisted.
    #[serde(default)]
    history: Vec<Turn>,
    /// Per-request sampling overrides, as top-level fields
    /// (`temperature`, `top_p`, `min_p`, `top_k`, `presence_penalty`).
    #[serde(flatten)]
    sampling: SamplingOverrides,
    /// Requested cap on response tokens.
    #[serde(default)]
    max_tokens: Option<usize>,
}

#[derive(Deserialize)]
struct CreateConversationBody {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn chat_error(err: ChatError) -> ApiError {
    let status = match &err {
        ChatError::Overflow(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ChatError::UnknownConversation(_) => StatusCode::NOT_FOUND,
        ChatError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ChatError::Engine(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn store_error(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Conversation not found: {id}"),
        }),
    )
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn chat_handler(
    State(state): State<SharedState>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    info!(
        message_len = body.message.len(),
        has_conversation = body.conversation_id.is_some(),
        "chat request"
    );

    let rx = state
        .controller
        .start(ChatRequest {
            message: body.message,
            conversation_id: body.conversation_id,
            history: body.history,
            sampling: body.sampling,
            max_tokens: body.max_tokens,
        })
        .await
        .map_err(chat_error)?;

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().data(data))
    });

    Ok(Sse::new(stream))
}

async fn list_conversations_handler(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ConversationMeta>>, ApiError> {
    let conversations = state.store.list_conversations().await.map_err(store_error)?;
    Ok(Json(conversations))
}

async fn create_conversation_handler(
    State(state): State<SharedState>,
    Json(body): Json<CreateConversationBody>,
) -> Result<(StatusCode, Json<ConversationMeta>), ApiError> {
    let title = body.title.unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let meta = state
        .store
        .create_conversation(&title)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn delete_conversation_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let existed = state
        .store
        .delete_conversation(&ConversationId::from(&id))
        .await
        .map_err(store_error)?;
    if existed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}

async fn list_messages_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    let conversation_id = ConversationId::from(&id);
    if state
        .store
        .get_conversation(&conversation_id)
        .await
        .map_err(store_error)?
        .is_none()
    {
        return Err(not_found(&id));
    }
    let turns = state
        .store
        .list_turns(&conversation_id)
        .await
        .map_err(store_error)?;
    Ok(Json(turns))
}

async fn clear_messages_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let conversation_id = ConversationId::from(&id);
    if state
        .store
        .get_conversation(&conversation_id)
        .await
        .map_err(store_error)?
        .is_none()
    {
        return Err(not_found(&id));
    }
    state
        .store
        .clear_turns(&conversation_id)
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}
