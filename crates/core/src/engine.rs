//! GenerationEngine trait — the abstraction over the text-generation model.
//!
//! An engine knows how to measure text in model-native token units and how
//! to turn a prompt into a lazy stream of text fragments. The rest of the
//! system never touches model weights, devices, or tokenizer files.
//!
//! Cancellation contract: the receiver returned by [`GenerationEngine::generate`]
//! is the lifeline of the generation. Dropping it must stop the underlying
//! compute promptly — implementations detect the closed channel on their
//! next send and bail out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Sampling configuration forwarded to the engine.
///
/// Pass-through by contract: values are typed but not range-validated here;
/// the engine applies what its sampler supports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Softmax temperature. `<= 0.0` means greedy (argmax) decoding.
    /// Typical range 0.0–2.0.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling threshold in (0.0, 1.0]. 1.0 disables it.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Minimum-probability threshold in [0.0, 1.0). 0.0 disables it.
    #[serde(default)]
    pub min_p: f32,

    /// Keep only the k most likely tokens. 0 disables it.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Flat penalty subtracted from the logits of already-generated tokens.
    /// 0.0 disables it.
    #[serde(default = "default_presence_penalty")]
    pub presence_penalty: f32,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    20
}
fn default_presence_penalty() -> f32 {
    1.0
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            min_p: 0.0,
            top_k: default_top_k(),
            presence_penalty: default_presence_penalty(),
        }
    }
}

/// A single generation call: fully assembled prompt text plus limits.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The complete prompt, already rendered in the engine's wire format.
    pub prompt: String,

    /// Hard cap on generated tokens, computed by the budget allocator.
    pub max_tokens: usize,

    /// Sampling configuration (pass-through).
    pub sampling: SamplingParams,

    /// Strings that terminate generation when they appear in the output.
    pub stop: Vec<String>,
}

/// Token-measurement capability, split out so the context pipeline can be
/// tested against a deterministic counter without loading a model.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    /// Count `text` in model-native token units.
    async fn count_tokens(&self, text: &str) -> std::result::Result<usize, EngineError>;
}

/// The generation capability.
///
/// One loaded model is a single shared compute resource: implementations
/// must serialize access internally (requests queue on the execution slot)
/// rather than assume reentrant concurrent calls.
#[async_trait]
pub trait GenerationEngine: TokenCounter {
    /// A human-readable name for this engine (e.g. "candle-local").
    fn name(&self) -> &str;

    /// Start a generation and return the fragment stream.
    ///
    /// Fragments arrive in generation order. The stream ends when the model
    /// emits EOS, hits a stop sequence, or reaches `max_tokens`. An `Err`
    /// item is terminal. Dropping the receiver cancels the generation.
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<String, EngineError>>,
        EngineError,
    >;
}
