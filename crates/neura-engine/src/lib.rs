//! Neura engine crate - the inference backend surface used by the chat core.
//!
//! Provides the `InferenceEngine` trait the session is written against, the
//! built-in chat template presets, a deterministic mock engine for tests and
//! development, and (behind the `llama` feature) a llama.cpp backend.

pub mod mock;
pub mod template;
pub mod utf8;

#[cfg(feature = "llama")]
pub mod llama;

use neura_core::error::NeuraError;
use neura_core::types::{ConversationEntry, Token};

pub use mock::MockEngine;
pub use template::{ChatTemplate, RoleMarkers};
pub use utf8::Utf8Assembler;

#[cfg(feature = "llama")]
pub use llama::{LlamaEngine, LlamaRuntime};

// =============================================================================
// Trait
// =============================================================================

/// Capabilities the chat core needs from an inference backend.
///
/// The engine owns its session cache exclusively. Every method is a blocking
/// call; the core never shares an engine across threads.
pub trait InferenceEngine {
    /// Render `history` through the engine's chat template into `buf`.
    ///
    /// Returns the full rendered length in bytes. When that length exceeds
    /// `buf.len()` nothing usable was written and the caller must retry with
    /// a buffer of at least the returned size.
    fn render_template(
        &self,
        history: &[ConversationEntry],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, NeuraError>;

    /// Convert text into tokens.
    ///
    /// `add_leading_marker` prepends the beginning-of-sequence marker and is
    /// only set for the first submission of a session. `parse_special` lets
    /// template control sequences map to their special tokens.
    fn encode(
        &self,
        text: &str,
        add_leading_marker: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, NeuraError>;

    /// Cache cells currently occupied.
    fn cache_used(&self) -> usize;

    /// Fixed cache capacity in cells.
    fn capacity(&self) -> usize;

    /// Process a batch of tokens, extending the cache.
    fn advance(&mut self, batch: &[Token]) -> Result<(), NeuraError>;

    /// Sample the next token from the distribution left by the last `advance`.
    fn sample_next(&mut self) -> Token;

    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Text of a single token. May be empty or contain control characters.
    ///
    /// A token carrying part of a multi-byte character yields nothing; the
    /// character comes out with the token that completes it.
    fn decode_to_text(&self, token: Token) -> String;

    /// Text still held back by `decode_to_text`, flushed at the end of a
    /// reply. Engines that always decode whole characters have none.
    fn finish_text(&mut self) -> String {
        String::new()
    }
}

/// Split a batch into decode-sized chunks, flagging the final one.
///
/// Backends only need next-token logits for the last token of the last chunk.
pub fn decode_chunks(batch: &[Token], n_batch: usize) -> impl Iterator<Item = (&[Token], bool)> {
    let n_batch = n_batch.max(1);
    let count = batch.len().div_ceil(n_batch);
    batch
        .chunks(n_batch)
        .enumerate()
        .map(move |(i, chunk)| (chunk, i + 1 == count))
}
