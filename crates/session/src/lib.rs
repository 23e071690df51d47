//! The streaming chat session layer.
//!
//! [`controller::ChatController`] drives one chat request end to end:
//! context budgeting, conversation persistence, engine invocation, and
//! per-fragment metering, emitting [`event::StreamEvent`]s for the
//! transport to forward.

pub mod controller;
pub mod event;

pub use controller::{ChatController, ChatError, ChatRequest, SamplingOverrides};
pub use event::StreamEvent;
