//! Candle-backed local engine: GGUF models, token-by-token streaming.
//!
//! The model sits behind a Mutex because CPU inference is inherently
//! single-threaded; concurrent requests queue on the lock. Generation runs
//! on a blocking thread and pushes decoded fragments through a bounded
//! channel. When the receiver is dropped the next `blocking_send` fails and
//! the loop bails out, which is how cancellation propagates.

use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama as qlm;
use hf_hub::api::sync::Api;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use chatspan_core::engine::{GenerationEngine, GenerationRequest, SamplingParams, TokenCounter};
use chatspan_core::error::EngineError;

/// Fixed sampling seed, so a given build is reproducible under test.
const SAMPLING_SEED: u64 = 42;

/// Bounded fragment channel. Small on purpose: backpressure from a slow
/// client reaches the generation loop quickly.
const FRAGMENT_CHANNEL_CAPACITY: usize = 8;

// ── Well-known model aliases ───────────────────────────────────────────

/// Friendly aliases resolving to HuggingFace repos and filenames. All
/// presets are ChatML-tuned models, matching the prompt wire format.
struct ModelPreset {
    repo: &'static str,
    gguf_file: &'static str,
    tokenizer_repo: &'static str,
}

fn resolve_preset(alias: &str) -> Option<ModelPreset> {
    let alias_lower = alias.to_lowercase();
    match alias_lower.as_str() {
        "qwen:0.5b" | "qwen-0.5b" | "qwen2-0.5b" => Some(ModelPreset {
            repo: "Qwen/Qwen2-0.5B-Instruct-GGUF",
            gguf_file: "qwen2-0_5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2-0.5B-Instruct",
        }),
        "qwen:1.5b" | "qwen-1.5b" | "qwen2-1.5b" => Some(ModelPreset {
            repo: "Qwen/Qwen2-1.5B-Instruct-GGUF",
            gguf_file: "qwen2-1_5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2-1.5B-Instruct",
        }),
        "smollm" | "smollm:135m" | "smollm-135m" => Some(ModelPreset {
            repo: "QuantFactory/SmolLM-135M-Instruct-GGUF",
            gguf_file: "SmolLM-135M-Instruct.Q4_K_M.gguf",
            tokenizer_repo: "HuggingFaceTB/SmolLM-135M-Instruct",
        }),
        "smollm:360m" | "smollm-360m" => Some(ModelPreset {
            repo: "QuantFactory/SmolLM-360M-Instruct-GGUF",
            gguf_file: "SmolLM-360M-Instruct.Q4_K_M.gguf",
            tokenizer_repo: "HuggingFaceTB/SmolLM-360M-Instruct",
        }),
        "openhermes" | "openhermes-2.5" => Some(ModelPreset {
            repo: "TheBloke/OpenHermes-2.5-Mistral-7B-GGUF",
            gguf_file: "openhermes-2.5-mistral-7b.Q4_K_M.gguf",
            tokenizer_repo: "teknium/OpenHermes-2.5-Mistral-7B",
        }),
        _ => None,
    }
}

// ── Local engine ───────────────────────────────────────────────────────

/// Runs GGUF-quantized language models locally via Candle.
#[derive(Debug)]
pub struct LocalEngine {
    inner: Arc<Mutex<Option<LocalModelState>>>,
    model_name: String,
}

/// The loaded model state (tokenizer + weights + device).
#[derive(Debug)]
struct LocalModelState {
    model: qlm::ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_id: u32,
}

impl LocalEngine {
    /// Create an engine that loads `model_name` lazily on first use.
    ///
    /// `model_name` can be a preset alias (`"qwen:0.5b"`, `"smollm:135m"`)
    /// or a path to a local `.gguf` file. The name is resolved here, without
    /// downloading anything, so a misconfigured model fails at startup
    /// instead of on the first request.
    pub fn new(model_name: &str) -> Result<Self, EngineError> {
        if resolve_preset(model_name).is_none()
            && !(model_name.ends_with(".gguf") && Path::new(model_name).exists())
        {
            return Err(unknown_model(model_name));
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(None)),
            model_name: model_name.to_string(),
        })
    }

    /// Eagerly load the model (downloads if needed, then loads into memory).
    pub fn load(model_name: &str) -> Result<Self, EngineError> {
        let state = LocalModelState::load(model_name)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(state))),
            model_name: model_name.to_string(),
        })
    }

    async fn ensure_loaded(&self) -> Result<(), EngineError> {
        let state = self.inner.lock().await;
        if state.is_some() {
            return Ok(());
        }
        drop(state);

        info!(model = %self.model_name, "Loading local model on first request");
        let name = self.model_name.clone();
        let loaded = tokio::task::spawn_blocking(move || LocalModelState::load(&name))
            .await
            .map_err(|e| EngineError::Inference(format!("Model loading task failed: {e}")))??;

        let mut state = self.inner.lock().await;
        if state.is_none() {
            *state = Some(loaded);
        }
        Ok(())
    }
}

impl LocalModelState {
    /// Load a model by preset alias or GGUF file path.
    fn load(model_name: &str) -> Result<Self, EngineError> {
        let device = Device::Cpu;

        if Path::new(model_name).exists() && model_name.ends_with(".gguf") {
            return Self::load_from_path(Path::new(model_name), &device);
        }

        let preset = resolve_preset(model_name).ok_or_else(|| unknown_model(model_name))?;

        info!(
            model = model_name,
            repo = preset.repo,
            file = preset.gguf_file,
            "Downloading/loading local model"
        );

        let api = Api::new().map_err(|e| {
            EngineError::Network(format!("Failed to initialize HuggingFace Hub API: {e}"))
        })?;

        let repo = api.model(preset.repo.to_string());
        let model_path = repo.get(preset.gguf_file).map_err(|e| {
            EngineError::Network(format!(
                "Failed to download model '{}' from '{}': {e}",
                preset.gguf_file, preset.repo
            ))
        })?;

        let tokenizer_repo = api.model(preset.tokenizer_repo.to_string());
        let tokenizer_path = tokenizer_repo.get("tokenizer.json").map_err(|e| {
            EngineError::Network(format!(
                "Failed to download tokenizer from '{}': {e}",
                preset.tokenizer_repo
            ))
        })?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EngineError::NotConfigured(format!("Failed to load tokenizer: {e}")))?;

        Self::load_weights(&model_path, tokenizer, device)
    }

    /// Load from an explicit GGUF file path, with `tokenizer.json` expected
    /// next to it.
    fn load_from_path(path: &Path, device: &Device) -> Result<Self, EngineError> {
        info!(path = %path.display(), "Loading local GGUF model");

        let tokenizer_path = path.with_file_name("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(EngineError::NotConfigured(format!(
                "No tokenizer.json next to {}",
                path.display()
            )));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EngineError::NotConfigured(format!("Failed to load tokenizer: {e}")))?;

        Self::load_weights(path, tokenizer, device.clone())
    }

    fn load_weights(
        path: &Path,
        tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self, EngineError> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| EngineError::NotConfigured(format!("Failed to open model file: {e}")))?;

        let gguf = gguf_file::Content::read(&mut file)
            .map_err(|e| EngineError::NotConfigured(format!("Failed to parse GGUF file: {e}")))?;

        let model = qlm::ModelWeights::from_gguf(gguf, &mut file, &device)
            .map_err(|e| EngineError::NotConfigured(format!("Failed to load model weights: {e}")))?;

        let eos_token_id = tokenizer
            .token_to_id("<|im_end|>")
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .or_else(|| tokenizer.token_to_id("</s>"))
            .unwrap_or(2);

        info!(eos_token_id, "Local model loaded");

        Ok(Self {
            model,
            tokenizer,
            device,
            eos_token_id,
        })
    }

    /// Token-by-token generation, pushing decoded fragments into `tx`.
    ///
    /// Returns normally on EOS, stop sequence, max_tokens, or a dropped
    /// receiver. Model errors propagate as `Err` and are forwarded in-band
    /// by the caller.
    fn generate_streaming(
        &mut self,
        request: &GenerationRequest,
        tx: &mpsc::Sender<Result<String, EngineError>>,
    ) -> Result<(), EngineError> {
        let encoding = self
            .tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(|e| EngineError::Tokenization(format!("Prompt encoding failed: {e}")))?;
        let prompt_ids = encoding.get_ids();

        debug!(
            prompt_tokens = prompt_ids.len(),
            max_tokens = request.max_tokens,
            temperature = request.sampling.temperature,
            "Starting local generation"
        );

        if request.sampling.min_p > 0.0 {
            debug!(
                min_p = request.sampling.min_p,
                "min_p is not supported by this backend; ignoring"
            );
        }

        let mut logits_processor = build_logits_processor(&request.sampling);
        let mut input = Tensor::new(prompt_ids, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(map_candle_err)?;

        let mut generated: Vec<u32> = Vec::new();
        let mut seen: HashSet<u32> = HashSet::new();
        let mut decoded = String::new();
        let mut emitted = 0usize;

        for step in 0..request.max_tokens {
            let index_pos = if step == 0 { 0 } else { prompt_ids.len() + step - 1 };
            // forward() returns last-position logits of shape (1, vocab).
            let logits = self
                .model
                .forward(&input, index_pos)
                .map_err(map_candle_err)?;
            let logits = logits.squeeze(0).map_err(map_candle_err)?;

            let logits = apply_presence_penalty(&logits, request.sampling.presence_penalty, &seen)
                .map_err(map_candle_err)?;

            let next_token = logits_processor.sample(&logits).map_err(map_candle_err)?;
            if next_token == self.eos_token_id {
                break;
            }

            generated.push(next_token);
            seen.insert(next_token);

            decoded = self
                .tokenizer
                .decode(&generated, true)
                .map_err(|e| EngineError::Tokenization(format!("Detokenization failed: {e}")))?;

            if let Some(stop_at) = find_stop(&decoded, &request.stop) {
                let tail = decoded
                    .get(emitted.min(stop_at)..stop_at)
                    .unwrap_or("")
                    .to_string();
                if !tail.is_empty() {
                    let _ = tx.blocking_send(Ok(tail));
                }
                decoded.truncate(stop_at);
                emitted = decoded.len();
                break;
            }

            // Hold back any tail that could still grow into a stop sequence,
            // so a marker split across tokens never leaks its prefix.
            let safe = decoded
                .get(..emit_cutoff(&decoded, &request.stop))
                .unwrap_or("");
            if let Some(delta) = next_fragment(safe, emitted) {
                let fragment = delta.to_string();
                emitted = safe.len();
                if tx.blocking_send(Ok(fragment)).is_err() {
                    debug!(generated = generated.len(), "Receiver dropped, stopping generation");
                    return Ok(());
                }
            }

            input = Tensor::new(&[next_token][..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(map_candle_err)?;
        }

        // Flush text held back as a potential stop prefix once generation
        // ends without the stop actually materializing.
        if let Some(tail) = next_fragment(&decoded, emitted) {
            let _ = tx.blocking_send(Ok(tail.to_string()));
        }

        debug!(
            completion_tokens = generated.len(),
            output_len = decoded.len(),
            "Generation complete"
        );
        Ok(())
    }
}

/// Map sampling parameters onto Candle's sampling strategies.
fn build_logits_processor(params: &SamplingParams) -> LogitsProcessor {
    if params.temperature <= 0.0 {
        return LogitsProcessor::from_sampling(SAMPLING_SEED, Sampling::ArgMax);
    }
    let temperature = params.temperature as f64;
    let sampling = match (params.top_k, params.top_p) {
        (0, p) if p >= 1.0 => Sampling::All { temperature },
        (0, p) => Sampling::TopP {
            p: p as f64,
            temperature,
        },
        (k, p) if p >= 1.0 => Sampling::TopK { k, temperature },
        (k, p) => Sampling::TopKThenTopP {
            k,
            p: p as f64,
            temperature,
        },
    };
    LogitsProcessor::from_sampling(SAMPLING_SEED, sampling)
}

/// Subtract a flat penalty from the logits of every already-generated token.
fn apply_presence_penalty(
    logits: &Tensor,
    penalty: f32,
    seen: &HashSet<u32>,
) -> candle_core::Result<Tensor> {
    if penalty == 0.0 || seen.is_empty() {
        return Ok(logits.clone());
    }
    let mut values = logits.to_vec1::<f32>()?;
    for &id in seen {
        if let Some(v) = values.get_mut(id as usize) {
            *v -= penalty;
        }
    }
    let len = values.len();
    Tensor::from_vec(values, len, logits.device())
}

/// Earliest byte offset at which any stop sequence begins, if present.
fn find_stop(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

/// Byte length of `text` that is safe to emit: a suffix matching a prefix of
/// any stop sequence is withheld until the next token disambiguates it.
fn emit_cutoff(text: &str, stops: &[String]) -> usize {
    let mut cutoff = text.len();
    for stop in stops.iter().filter(|s| !s.is_empty()) {
        let longest = stop.len().min(text.len());
        for k in (1..=longest).rev() {
            if stop.get(..k).is_some_and(|prefix| text.ends_with(prefix)) {
                cutoff = cutoff.min(text.len() - k);
                break;
            }
        }
    }
    cutoff
}

/// The not-yet-emitted tail of the decoded text, held back while it ends in
/// a UTF-8 replacement character (a multi-byte sequence still mid-flight).
fn next_fragment(decoded: &str, emitted: usize) -> Option<&str> {
    if decoded.len() <= emitted || decoded.ends_with('\u{FFFD}') {
        return None;
    }
    decoded.get(emitted..)
}

/// Map Candle errors to the engine error type.
fn map_candle_err(e: candle_core::Error) -> EngineError {
    EngineError::Inference(format!("Candle inference error: {e}"))
}

fn unknown_model(model_name: &str) -> EngineError {
    EngineError::ModelNotFound(format!(
        "Unknown local model '{model_name}'. Available presets: qwen:0.5b, qwen:1.5b, \
         smollm:135m, smollm:360m, openhermes. Or provide a path to a .gguf file."
    ))
}

#[async_trait]
impl TokenCounter for LocalEngine {
    async fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        self.ensure_loaded().await?;
        let inner = self.inner.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = inner.blocking_lock();
            let state = guard.as_ref().ok_or_else(|| {
                EngineError::NotConfigured("model state missing after load".into())
            })?;
            let encoding = state
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| EngineError::Tokenization(format!("Encoding failed: {e}")))?;
            Ok(encoding.get_ids().len())
        })
        .await
        .map_err(|e| EngineError::Inference(format!("Token counting task failed: {e}")))?
    }
}

#[async_trait]
impl GenerationEngine for LocalEngine {
    fn name(&self) -> &str {
        "candle-local"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError> {
        self.ensure_loaded().await?;

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.blocking_lock();
            let Some(state) = guard.as_mut() else {
                let _ = tx.blocking_send(Err(EngineError::NotConfigured(
                    "model state missing after load".into(),
                )));
                return;
            };
            if let Err(err) = state.generate_streaming(&request, &tx) {
                warn!(error = %err, "Local generation failed");
                let _ = tx.blocking_send(Err(err));
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_preset_aliases() {
        assert!(resolve_preset("qwen:0.5b").is_some());
        assert!(resolve_preset("QWEN:0.5B").is_some());
        assert!(resolve_preset("smollm:135m").is_some());
        assert!(resolve_preset("openhermes").is_some());
        assert!(resolve_preset("nonexistent").is_none());
    }

    #[test]
    fn unknown_model_is_model_not_found() {
        let err = LocalModelState::load("definitely-not-a-model").unwrap_err();
        assert!(matches!(err, EngineError::ModelNotFound(_)));
    }

    #[test]
    fn engine_construction_fails_fast_on_bad_alias() {
        let err = LocalEngine::new("no-such-model").unwrap_err();
        assert!(matches!(err, EngineError::ModelNotFound(_)));
        assert!(LocalEngine::new("qwen:0.5b").is_ok());
    }

    #[test]
    fn find_stop_picks_earliest_match() {
        let stops = vec!["<|im_end|>".to_string(), "STOP".to_string()];
        assert_eq!(find_stop("hello STOP more <|im_end|>", &stops), Some(6));
        assert_eq!(find_stop("no terminator here", &stops), None);
    }

    #[test]
    fn find_stop_ignores_empty_sequences() {
        let stops = vec![String::new()];
        assert_eq!(find_stop("anything", &stops), None);
    }

    #[test]
    fn partial_stop_marker_is_withheld_from_emission() {
        let stops = vec!["<|im_end|>".to_string()];
        // "<|im_" could still become the full marker: hold it back.
        assert_eq!(emit_cutoff("hello <|im_", &stops), 6);
        assert_eq!(emit_cutoff("hello <", &stops), 6);
        // Nothing stop-like at the end: everything may go out.
        assert_eq!(emit_cutoff("hello world", &stops), 11);
        assert_eq!(emit_cutoff("", &stops), 0);
    }

    #[test]
    fn longest_stop_prefix_wins() {
        let stops = vec!["STOP".to_string(), "OPS".to_string()];
        // "...ST" matches a prefix of STOP; "...OPS" would match all of OPS
        // but a full match is find_stop's job, handled before emission.
        assert_eq!(emit_cutoff("abST", &stops), 2);
        assert_eq!(emit_cutoff("abO", &stops), 2);
    }

    #[test]
    fn fragment_held_back_while_multibyte_incomplete() {
        assert_eq!(next_fragment("abc\u{FFFD}", 3), None);
        assert_eq!(next_fragment("abcdef", 3), Some("def"));
        assert_eq!(next_fragment("abc", 3), None);
    }

    #[test]
    fn presence_penalty_lowers_seen_tokens_only() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], 4, &device).unwrap();
        let seen: HashSet<u32> = [1, 3].into_iter().collect();

        let adjusted = apply_presence_penalty(&logits, 1.5, &seen).unwrap();
        let values = adjusted.to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 0.5, 3.0, 2.5]);
    }

    #[test]
    fn zero_penalty_is_identity() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![1.0f32, 2.0], 2, &device).unwrap();
        let seen: HashSet<u32> = [0].into_iter().collect();

        let adjusted = apply_presence_penalty(&logits, 0.0, &seen).unwrap();
        assert_eq!(adjusted.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn greedy_sampler_for_zero_temperature() {
        // Argmax must be deterministic regardless of the other knobs.
        let params = SamplingParams {
            temperature: 0.0,
            ..SamplingParams::default()
        };
        let mut processor = build_logits_processor(&params);
        let logits = Tensor::from_vec(vec![0.1f32, 5.0, 0.2], 3, &Device::Cpu).unwrap();
        assert_eq!(processor.sample(&logits).unwrap(), 1);
    }
}
