//! ChatML wire format rendering.
//!
//! The served models are instruction-tuned on ChatML, so every prompt block
//! takes the shape `<|im_start|>{role}\n{content}<|im_end|>`. The close
//! marker doubles as the generation stop sequence.

use chatspan_core::turn::{Role, Turn};

/// Opens a ChatML block.
pub const TURN_OPEN: &str = "<|im_start|>";

/// Closes a ChatML block. Also the stop sequence handed to the engine.
pub const TURN_CLOSE: &str = "<|im_end|>";

/// Render one complete block for an arbitrary role string.
pub fn render_block(role: &str, content: &str) -> String {
    format!("{TURN_OPEN}{role}\n{content}{TURN_CLOSE}")
}

/// Render a stored turn as a complete block.
pub fn render_turn(turn: &Turn) -> String {
    render_block(turn.role.as_str(), &turn.content)
}

/// Render the system preamble block.
pub fn render_system(preamble: &str) -> String {
    render_block("system", preamble)
}

/// The open assistant block that cues the model to respond. Deliberately
/// unterminated: the model's output continues it.
pub fn assistant_cue() -> String {
    format!("{TURN_OPEN}{}\n", Role::Assistant.as_str())
}
