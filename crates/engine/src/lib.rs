//! Local inference for chatspan.
//!
//! [`local::LocalEngine`] runs GGUF-quantized language models on the host
//! CPU via [Candle](https://github.com/huggingface/candle): no separate
//! inference server, no API keys.

pub mod local;

pub use local::LocalEngine;
