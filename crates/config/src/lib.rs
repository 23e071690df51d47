//! Configuration loading and validation for chatspan.
//!
//! Loads `chatspan.toml` with environment variable overrides and validates
//! all settings at startup. The context-window section is the single source
//! of truth for window capacity, history budget fraction, and reserved
//! margin — there is deliberately no second place these numbers can live.

use chatspan_core::engine::SamplingParams;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are fatal: no request processing is possible without a valid
/// configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The root configuration structure. Maps directly to `chatspan.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// System instructions prepended to every prompt. Configuration-supplied,
    /// never user-controllable.
    #[serde(default = "default_preamble")]
    pub preamble: String,

    /// Model selection
    #[serde(default)]
    pub model: ModelConfig,

    /// Context-window budgeting
    #[serde(default)]
    pub context: ContextWindowConfig,

    /// Default sampling parameters (overridable per request)
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Durable store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_preamble() -> String {
    "You are a helpful AI assistant. Answer the user's questions clearly and concisely.".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            preamble: default_preamble(),
            model: ModelConfig::default(),
            context: ContextWindowConfig::default(),
            sampling: SamplingConfig::default(),
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// A preset alias (`qwen:0.5b`, `smollm:135m`) or a path to a `.gguf` file.
    #[serde(default = "default_model_name")]
    pub name: String,
}

fn default_model_name() -> String {
    "qwen:0.5b".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
        }
    }
}

/// The context-window budget, shared by the truncator and the allocator.
///
/// One fixed capacity `C` covers preamble + history + new user turn +
/// response + reserved margin. The invariant enforced downstream:
/// `prompt_tokens + reserved_margin + response_cap <= window_capacity`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextWindowConfig {
    /// Total window capacity in model token units.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Fraction of the window offered to historical turns during
    /// truncation. A soft pre-filter: the assembled prompt is re-measured.
    #[serde(default = "default_history_budget_fraction")]
    pub history_budget_fraction: f64,

    /// Small fixed allowance held back for protocol/stop-sequence overhead.
    #[serde(default = "default_reserved_margin")]
    pub reserved_margin: usize,
}

fn default_window_capacity() -> usize {
    16384
}
fn default_history_budget_fraction() -> f64 {
    0.75
}
fn default_reserved_margin() -> usize {
    64
}

impl ContextWindowConfig {
    /// Token budget the truncator may spend on historical turns.
    pub fn history_budget(&self) -> usize {
        (self.window_capacity as f64 * self.history_budget_fraction) as usize
    }
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            history_budget_fraction: default_history_budget_fraction(),
            reserved_margin: default_reserved_margin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Default sampling parameters forwarded to the engine.
    #[serde(flatten)]
    pub params: SamplingParams,

    /// Default cap on response tokens when the request doesn't set one.
    /// The allocator may shrink it further.
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: usize,
}

fn default_max_response_tokens() -> usize {
    4096
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            params: SamplingParams::default(),
            max_response_tokens: default_max_response_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS. The default covers the Vite dev server.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5173".into()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `sqlite::memory:` gives an ephemeral store.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "chatspan.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file doesn't exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            toml::from_str(&raw)?
        } else {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides: `CHATSPAN_MODEL`, `CHATSPAN_PORT`, `CHATSPAN_DB`.
    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("CHATSPAN_MODEL") {
            self.model.name = model;
        }
        if let Ok(port) = std::env::var("CHATSPAN_PORT") {
            match port.parse() {
                Ok(p) => self.gateway.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring non-numeric CHATSPAN_PORT"),
            }
        }
        if let Ok(db) = std::env::var("CHATSPAN_DB") {
            self.store.path = db;
        }
    }

    /// Validate settings that would otherwise fail deep inside a request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.window_capacity == 0 {
            return Err(ConfigError::Invalid("window_capacity must be > 0".into()));
        }
        if !(self.context.history_budget_fraction > 0.0
            && self.context.history_budget_fraction <= 1.0)
        {
            return Err(ConfigError::Invalid(
                "history_budget_fraction must be in (0, 1]".into(),
            ));
        }
        if self.context.reserved_margin >= self.context.window_capacity {
            return Err(ConfigError::Invalid(
                "reserved_margin must be smaller than window_capacity".into(),
            ));
        }
        if self.preamble.trim().is_empty() {
            return Err(ConfigError::Invalid("preamble must not be empty".into()));
        }
        if self.model.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model.name must not be empty".into()));
        }
        Ok(())
    }

    /// Serialize the current config as a TOML document (for `chatspan init`).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
