//! Prompt assembly: render the final prompt string the engine consumes.

use chatspan_core::turn::Turn;

use crate::template::{assistant_cue, render_system, render_turn};

/// Render the complete prompt: system preamble, surviving history in
/// chronological order, the new user message, and an open assistant block
/// cueing the model to respond.
///
/// Blocks are joined by single newlines. The output is deterministic in its
/// inputs; token counting happens afterwards, on exactly this string.
pub fn assemble_prompt(preamble: &str, history: &[Turn], message: &str) -> String {
    let mut prompt = render_system(preamble);
    for turn in history {
        prompt.push('\n');
        prompt.push_str(&render_turn(turn));
    }
    prompt.push('\n');
    prompt.push_str(&render_turn(&Turn::user(message)));
    prompt.push('\n');
    prompt.push_str(&assistant_cue());
    prompt
}
