//! Core domain types and capability traits for chatspan.
//!
//! Everything that crosses a crate boundary lives here: the conversation
//! value types, the generation-engine and conversation-store capability
//! traits, and the error taxonomy.

pub mod engine;
pub mod error;
pub mod store;
pub mod turn;
