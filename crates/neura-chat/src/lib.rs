//! Conversational session core for Neura.
//!
//! Turns free-text user turns into template-formatted, context-bounded
//! prompts, drives token-by-token generation against an `InferenceEngine`,
//! and keeps the multi-turn transcript and its rendered-prompt cursor in step
//! with what the engine has already consumed.

pub mod error;
pub mod formatter;
pub mod generation;
pub mod guard;
pub mod operator;
pub mod session;
pub mod state;
pub mod tracker;

pub use error::ChatError;
pub use formatter::TurnFormatter;
pub use generation::{
    CancelFlag, GenerationLoop, GenerationResult, SanitizePolicy, TerminationReason,
};
pub use guard::ContextGuard;
pub use operator::{LineOperator, Operator};
pub use session::{ChatSession, ConversationHistory, SessionSummary, TurnOutcome};
pub use state::SessionState;
pub use tracker::PromptCursor;
