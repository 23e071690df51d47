//! Context-window budgeting for chatspan.
//!
//! Three small stages run before any generation compute:
//!
//! 1. [`truncate::truncate_history`] keeps the newest suffix of the
//!    conversation that fits the history budget, never splitting a turn.
//! 2. [`assemble::assemble_prompt`] renders preamble, surviving history,
//!    and the new user message into the model's wire format.
//! 3. [`budget::allocate_response_budget`] measures the assembled prompt
//!    and decides how many response tokens the engine may produce.
//!
//! The pipeline is pure apart from token counting, which goes through the
//! [`chatspan_core::engine::TokenCounter`] capability so tests can run
//! against a deterministic counter.

pub mod assemble;
pub mod budget;
pub mod template;
pub mod truncate;

pub use assemble::assemble_prompt;
pub use budget::allocate_response_budget;
pub use truncate::{truncate_history, TruncationOutcome};
