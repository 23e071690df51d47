//! History truncation: keep the newest suffix of turns that fits a budget.

use chatspan_core::engine::TokenCounter;
use chatspan_core::error::EngineError;
use chatspan_core::turn::Turn;

use crate::template::render_turn;

/// What survived truncation, plus enough numbers to log the decision.
#[derive(Debug, Clone)]
pub struct TruncationOutcome {
    /// The surviving suffix, still in chronological order.
    pub turns: Vec<Turn>,
    /// How many turns the full history had.
    pub turns_before: usize,
    /// Token cost of the surviving turns, as rendered blocks.
    pub tokens_used: usize,
}

impl TruncationOutcome {
    /// Number of turns dropped from the front of the history.
    pub fn turns_dropped(&self) -> usize {
        self.turns_before - self.turns.len()
    }
}

/// Walk the history newest to oldest, admitting whole turns while they fit
/// within `budget` tokens, then return the admitted suffix in chronological
/// order.
///
/// Turns are measured in rendered wire format so the budget accounts for
/// role markers, not just content. A turn is either kept whole or dropped;
/// content is never split. The budget is a soft pre-filter: the assembled
/// prompt is re-measured before allocation, so slight tokenizer nonlinearity
/// across block boundaries is absorbed by the reserved margin.
pub async fn truncate_history(
    counter: &dyn TokenCounter,
    history: &[Turn],
    budget: usize,
) -> Result<TruncationOutcome, EngineError> {
    let mut kept: Vec<Turn> = Vec::new();
    let mut tokens_used = 0usize;

    for turn in history.iter().rev() {
        let cost = counter.count_tokens(&render_turn(turn)).await?;
        if tokens_used + cost > budget {
            break;
        }
        tokens_used += cost;
        kept.push(turn.clone());
    }

    kept.reverse();

    if kept.len() < history.len() {
        tracing::debug!(
            turns_before = history.len(),
            turns_kept = kept.len(),
            tokens_used,
            budget,
            "Truncated conversation history"
        );
    }

    Ok(TruncationOutcome {
        turns: kept,
        turns_before: history.len(),
        tokens_used,
    })
}
