//! The streaming generation controller.
//!
//! One [`ChatController::start`] call drives a full chat turn:
//!
//! 1. Resolve history (stored log or inline turns), truncate it to the
//!    history budget, assemble the prompt, measure it, and allocate the
//!    response budget. Everything up to here is validation: it fails with a
//!    [`ChatError`] before any side effect.
//! 2. Create the conversation if the request didn't name one, then append
//!    the user turn to the log.
//! 3. Invoke the engine and forward fragments as [`StreamEvent`]s, metering
//!    throughput from the first fragment.
//! 4. Persist the assistant turn and emit the terminal `Done` frame. A
//!    persistence failure at this point is reported as a warning flag on
//!    `Done`, never as an error: the client already holds the tokens.
//!
//! If the event receiver is dropped mid-stream the forward loop stops and
//! drops the engine receiver, which cancels the underlying generation. The
//! partial assistant text is discarded, not persisted.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use chatspan_config::ContextWindowConfig;
use chatspan_core::engine::{GenerationEngine, GenerationRequest, SamplingParams};
use chatspan_core::error::{ContextError, EngineError, StoreError};
use chatspan_core::store::ConversationStore;
use chatspan_core::turn::{derive_title, ConversationId, Turn, DEFAULT_TITLE};
use chatspan_context::template::TURN_CLOSE;
use chatspan_context::{allocate_response_budget, assemble_prompt, truncate_history};

use crate::event::StreamEvent;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One incoming chat request, already deserialized and role-validated.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The new user message.
    pub message: String,
    /// Continue this stored conversation. When absent a new one is created.
    pub conversation_id: Option<String>,
    /// Inline history for requests without a `conversation_id`. Seeds the
    /// prompt only; it is not written to the store.
    pub history: Vec<Turn>,
    /// Per-request sampling overrides. Absent fields fall back to the
    /// configured defaults.
    pub sampling: SamplingOverrides,
    /// Requested cap on response tokens. The allocator may shrink it.
    pub max_tokens: Option<usize>,
}

/// Optional per-request sampling knobs, layered over configured defaults.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub top_k: Option<usize>,
    pub presence_penalty: Option<f32>,
}

impl SamplingOverrides {
    /// Apply the set fields on top of `base`.
    pub fn apply(self, mut base: SamplingParams) -> SamplingParams {
        if let Some(temperature) = self.temperature {
            base.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            base.top_p = top_p;
        }
        if let Some(min_p) = self.min_p {
            base.min_p = min_p;
        }
        if let Some(top_k) = self.top_k {
            base.top_k = top_k;
        }
        if let Some(presence_penalty) = self.presence_penalty {
            base.presence_penalty = presence_penalty;
        }
        base
    }
}

/// Failures surfaced before streaming begins. Once the first fragment has
/// been emitted, failures travel in-band as `StreamEvent::Error` instead.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Overflow(#[from] ContextError),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Conversation store failed: {0}")]
    History(#[from] StoreError),

    #[error("Generation engine failed: {0}")]
    Engine(#[from] EngineError),
}

/// Drives chat requests against one engine and one store.
pub struct ChatController {
    engine: Arc<dyn GenerationEngine>,
    store: Arc<dyn ConversationStore>,
    window: ContextWindowConfig,
    preamble: String,
    default_sampling: SamplingParams,
    default_max_tokens: usize,
}

impl ChatController {
    pub fn new(
        engine: Arc<dyn GenerationEngine>,
        store: Arc<dyn ConversationStore>,
        window: ContextWindowConfig,
        preamble: String,
        default_sampling: SamplingParams,
        default_max_tokens: usize,
    ) -> Self {
        Self {
            engine,
            store,
            window,
            preamble,
            default_sampling,
            default_max_tokens,
        }
    }

    /// Validate and launch one chat turn, returning the event stream.
    ///
    /// Validation errors (overflow, unknown conversation, store or engine
    /// startup failures) return `Err` before anything observable happens.
    /// After that the stream carries the outcome.
    pub async fn start(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ChatError> {
        // Phase 1: budget the context window. No side effects yet.
        let (history, existing) = match &request.conversation_id {
            Some(id) => {
                let id = ConversationId::from(id.clone());
                let meta = self
                    .store
                    .get_conversation(&id)
                    .await?
                    .ok_or_else(|| ChatError::UnknownConversation(id.to_string()))?;
                (self.store.list_turns(&id).await?, Some(meta))
            }
            None => (request.history.clone(), None),
        };

        let outcome = truncate_history(
            self.engine.as_ref(),
            &history,
            self.window.history_budget(),
        )
        .await?;

        let prompt = assemble_prompt(&self.preamble, &outcome.turns, &request.message);
        let prompt_tokens = self.engine.count_tokens(&prompt).await?;
        let requested_cap = request.max_tokens.unwrap_or(self.default_max_tokens);
        let max_tokens = allocate_response_budget(prompt_tokens, requested_cap, &self.window)?;

        tracing::debug!(
            prompt_tokens,
            max_tokens,
            turns_dropped = outcome.turns_dropped(),
            "Context window budgeted"
        );

        // Phase 2: pin the conversation and record the user turn.
        let (conversation_id, created) = match existing {
            Some(meta) => {
                if history.is_empty() && meta.title == DEFAULT_TITLE {
                    // First message into an endpoint-created conversation
                    // names it. A cleared log keeps its derived title.
                    self.store
                        .set_title(&meta.id, &derive_title(&request.message))
                        .await?;
                }
                (meta.id, false)
            }
            None => {
                let meta = self
                    .store
                    .create_conversation(&derive_title(&request.message))
                    .await?;
                (meta.id, true)
            }
        };

        self.store
            .append_turn(&conversation_id, &Turn::user(&request.message))
            .await?;

        // Phase 3: start the engine. Failure here still precedes any frame.
        let generation = GenerationRequest {
            prompt,
            max_tokens,
            sampling: request.sampling.apply(self.default_sampling),
            stop: vec![TURN_CLOSE.to_string()],
        };
        let engine_rx = self.engine.generate(generation).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let store = Arc::clone(&self.store);
        tokio::spawn(stream_response(
            engine_rx,
            tx,
            store,
            conversation_id,
            created,
        ));
        Ok(rx)
    }
}

/// Forward engine fragments to the client, then settle the conversation log.
async fn stream_response(
    mut engine_rx: mpsc::Receiver<Result<String, EngineError>>,
    tx: mpsc::Sender<StreamEvent>,
    store: Arc<dyn ConversationStore>,
    conversation_id: ConversationId,
    created: bool,
) {
    if created {
        let event = StreamEvent::conversation(conversation_id.to_string());
        if tx.send(event).await.is_err() {
            return;
        }
    }

    let mut response = String::new();
    let mut total_tokens = 0usize;
    let mut first_fragment_at: Option<Instant> = None;

    while let Some(item) = engine_rx.recv().await {
        match item {
            Ok(fragment) => {
                first_fragment_at.get_or_insert_with(Instant::now);
                total_tokens += 1;
                response.push_str(&fragment);
                if tx.send(StreamEvent::token(fragment)).await.is_err() {
                    // Client gone. Dropping engine_rx cancels the generation;
                    // the partial response is discarded.
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        streamed = total_tokens,
                        "Client disconnected mid-stream, cancelling generation"
                    );
                    return;
                }
            }
            Err(err) => {
                tracing::error!(conversation_id = %conversation_id, error = %err, "Generation failed mid-stream");
                let _ = tx.send(StreamEvent::error(err.to_string())).await;
                return;
            }
        }
    }

    let elapsed = first_fragment_at.map(|t| t.elapsed().as_secs_f64());
    let tokens_per_second = match elapsed {
        Some(secs) if secs > 0.0 => total_tokens as f64 / secs,
        _ => 0.0,
    };

    let history_sync_failed = match store
        .append_turn(&conversation_id, &Turn::assistant(&response))
        .await
    {
        Ok(()) => false,
        Err(err) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %err,
                "Response streamed but could not be written to the conversation log"
            );
            true
        }
    };

    let _ = tx
        .send(StreamEvent::done(
            total_tokens,
            tokens_per_second,
            conversation_id.to_string(),
            history_sync_failed,
        ))
        .await;
}
