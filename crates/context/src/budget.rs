//! Response budget allocation against the fixed context window.

use chatspan_config::ContextWindowConfig;
use chatspan_core::error::ContextError;

/// Decide how many tokens the engine may generate for this request.
///
/// The window holds prompt, response, and a reserved margin:
/// `prompt_tokens + reserved_margin + grant <= window_capacity`. When the
/// prompt and margin already fill the window the request is rejected with
/// [`ContextError::Overflow`] rather than granted a zero or negative budget.
/// Otherwise the grant is the requested cap, shrunk to what actually fits.
pub fn allocate_response_budget(
    prompt_tokens: usize,
    requested_cap: usize,
    window: &ContextWindowConfig,
) -> Result<usize, ContextError> {
    let committed = prompt_tokens + window.reserved_margin;
    if committed >= window.window_capacity {
        return Err(ContextError::Overflow {
            prompt_tokens,
            window_capacity: window.window_capacity,
            reserved_margin: window.reserved_margin,
        });
    }
    let available = window.window_capacity - committed;
    Ok(requested_cap.min(available))
}
