//! Generation loop: encode the submission slice, then advance and sample one
//! token at a time until the engine signals the end of the reply.
//!
//! Each decode step is gated by the `ContextGuard`. A turn that fails for any
//! reason returns no text; partial output is never handed back as a reply.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use neura_core::types::Token;
use neura_engine::InferenceEngine;

use crate::error::ChatError;
use crate::guard::ContextGuard;

// =============================================================================
// Result types
// =============================================================================

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    EndOfGeneration,
    TokenLimitReached,
    ContextExhausted,
    EngineError,
    Cancelled,
}

impl TerminationReason {
    /// Whether the reply should be kept.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminationReason::EndOfGeneration | TerminationReason::TokenLimitReached
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationReason::EndOfGeneration => "end_of_generation",
            TerminationReason::TokenLimitReached => "token_limit_reached",
            TerminationReason::ContextExhausted => "context_exhausted",
            TerminationReason::EngineError => "engine_error",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Outcome of one generation.
#[derive(Debug)]
pub struct GenerationResult {
    /// Assembled reply. Always empty when `reason` is not a success.
    pub text: String,
    pub reason: TerminationReason,
    /// Tokens decoded into text, including those of a discarded reply.
    pub tokens: usize,
    /// Cause of a failed generation.
    pub error: Option<ChatError>,
}

impl GenerationResult {
    fn finished(text: String, reason: TerminationReason, tokens: usize) -> Self {
        Self {
            text,
            reason,
            tokens,
            error: None,
        }
    }

    fn failed(reason: TerminationReason, tokens: usize, error: ChatError) -> Self {
        Self {
            text: String::new(),
            reason,
            tokens,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason.is_success()
    }

    /// The reply text, or the error that ended the turn.
    pub fn into_reply(self) -> Result<String, ChatError> {
        if self.reason.is_success() {
            return Ok(self.text);
        }
        Err(self
            .error
            .unwrap_or_else(|| ChatError::Engine(self.reason.to_string())))
    }
}

// =============================================================================
// Policies
// =============================================================================

/// Post-processing applied to reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SanitizePolicy {
    #[default]
    Verbatim,
    /// Replace control characters other than newline and tab.
    Placeholder(char),
}

impl SanitizePolicy {
    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self {
            SanitizePolicy::Verbatim => Cow::Borrowed(text),
            SanitizePolicy::Placeholder(placeholder) => {
                if !text.chars().any(is_unprintable) {
                    return Cow::Borrowed(text);
                }
                Cow::Owned(
                    text.chars()
                        .map(|c| if is_unprintable(c) { *placeholder } else { c })
                        .collect(),
                )
            }
        }
    }
}

fn is_unprintable(c: char) -> bool {
    c.is_control() && c != '\n' && c != '\t'
}

/// Cooperative cancellation shared between the session and its host.
///
/// Checked once per generated token, never in the middle of a decode.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Drives one reply against an engine.
#[derive(Debug, Clone, Default)]
pub struct GenerationLoop {
    guard: ContextGuard,
    max_tokens: Option<usize>,
    sanitize: SanitizePolicy,
    cancel: CancelFlag,
}

impl GenerationLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the reply length. `None` or `Some(0)` means unbounded.
    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens.filter(|&n| n > 0);
        self
    }

    pub fn with_sanitize(mut self, sanitize: SanitizePolicy) -> Self {
        self.sanitize = sanitize;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn max_tokens(&self) -> Option<usize> {
        self.max_tokens
    }

    /// Generate a reply to `prompt_suffix`, reporting each piece to `on_piece`.
    ///
    /// The leading marker is requested only when the engine cache is empty,
    /// so a session resumed on a warm cache does not get a second one.
    ///
    /// # Errors
    /// `ChatError::Encode` if the suffix cannot be tokenized. Every other
    /// failure is reported through the returned `GenerationResult`.
    pub fn generate<E: InferenceEngine + ?Sized>(
        &self,
        engine: &mut E,
        prompt_suffix: &str,
        on_piece: &mut dyn FnMut(&str),
    ) -> Result<GenerationResult, ChatError> {
        self.cancel.reset();
        let stale = engine.finish_text();
        if !stale.is_empty() {
            tracing::debug!(bytes = stale.len(), "Dropping undecoded text from a previous turn");
        }

        let is_first = engine.cache_used() == 0;
        let prompt = engine.encode(prompt_suffix, is_first, true)?;
        tracing::debug!(
            suffix_bytes = prompt_suffix.len(),
            prompt_tokens = prompt.len(),
            is_first,
            "Prompt encoded"
        );

        if prompt.is_empty() {
            return Ok(GenerationResult::failed(
                TerminationReason::EngineError,
                0,
                ChatError::Engine("nothing to submit: prompt encoded to zero tokens".to_string()),
            ));
        }

        let mut batch: Vec<Token> = prompt;
        let mut reply = String::new();
        let mut produced = 0usize;

        loop {
            if !self.guard.admit(&*engine, batch.len()) {
                let err = ChatError::ContextExhausted {
                    used: engine.cache_used(),
                    pending: batch.len(),
                    capacity: engine.capacity(),
                };
                return Ok(GenerationResult::failed(
                    TerminationReason::ContextExhausted,
                    produced,
                    err,
                ));
            }

            if let Err(e) = engine.advance(&batch) {
                tracing::warn!(error = %e, produced, "Decode failed, discarding partial reply");
                return Ok(GenerationResult::failed(
                    TerminationReason::EngineError,
                    produced,
                    ChatError::from(e),
                ));
            }

            let token = engine.sample_next();
            if engine.is_end_of_generation(token) {
                self.flush_tail(engine, &mut reply, on_piece);
                tracing::debug!(tokens = produced, "End of generation");
                return Ok(GenerationResult::finished(
                    reply,
                    TerminationReason::EndOfGeneration,
                    produced,
                ));
            }

            let raw = engine.decode_to_text(token);
            let piece = self.sanitize.apply(&raw);
            tracing::trace!(token = %token, piece = %piece, "Token generated");
            on_piece(&piece);
            reply.push_str(&piece);
            produced += 1;

            if self.max_tokens.is_some_and(|max| produced >= max) {
                self.flush_tail(engine, &mut reply, on_piece);
                tracing::debug!(tokens = produced, "Token limit reached");
                return Ok(GenerationResult::finished(
                    reply,
                    TerminationReason::TokenLimitReached,
                    produced,
                ));
            }

            if self.cancel.is_cancelled() {
                tracing::info!(tokens = produced, "Generation cancelled");
                return Ok(GenerationResult::failed(
                    TerminationReason::Cancelled,
                    produced,
                    ChatError::Cancelled,
                ));
            }

            batch.clear();
            batch.push(token);
        }
    }

    /// Append text the engine held back waiting for the rest of a character.
    fn flush_tail<E: InferenceEngine + ?Sized>(
        &self,
        engine: &mut E,
        reply: &mut String,
        on_piece: &mut dyn FnMut(&str),
    ) {
        let tail = engine.finish_text();
        if tail.is_empty() {
            return;
        }
        let piece = self.sanitize.apply(&tail);
        on_piece(&piece);
        reply.push_str(&piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neura_engine::{ChatTemplate, MockEngine};

    fn engine(capacity: usize) -> MockEngine {
        MockEngine::new(ChatTemplate::plain("plain"), capacity)
    }

    fn run(lp: &GenerationLoop, e: &mut MockEngine, suffix: &str) -> GenerationResult {
        lp.generate(e, suffix, &mut |_: &str| {}).unwrap()
    }

    #[test]
    fn test_immediate_end_of_generation() {
        let mut e = engine(64).with_reply(&[]);
        let result = run(&GenerationLoop::new(), &mut e, "hi");
        assert_eq!(result.reason, TerminationReason::EndOfGeneration);
        assert_eq!(result.text, "");
        assert_eq!(result.tokens, 0);
        assert!(result.is_success());
    }

    #[test]
    fn test_reply_is_assembled() {
        let mut e = engine(64).with_reply(&["h", "i"]);
        let mut streamed = Vec::new();
        let result = GenerationLoop::new()
            .generate(&mut e, "S<hello>", &mut |p: &str| streamed.push(p.to_string()))
            .unwrap();
        assert_eq!(result.text, "hi");
        assert_eq!(result.reason, TerminationReason::EndOfGeneration);
        assert_eq!(streamed, vec!["h", "i"]);
    }

    #[test]
    fn test_first_batch_is_prompt_then_single_tokens() {
        let mut e = engine(64).with_reply(&["h", "i"]);
        run(&GenerationLoop::new(), &mut e, "abc");
        let batches = e.submitted();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 4); // marker + 3 chars
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[2].len(), 1);
        assert_eq!(e.text_of(&batches[1]), "h");
        assert_eq!(e.text_of(&batches[2]), "i");
    }

    #[test]
    fn test_token_cap() {
        let mut e = engine(64).with_endless("x");
        let lp = GenerationLoop::new().with_max_tokens(Some(3));
        let result = run(&lp, &mut e, "go");
        assert_eq!(result.reason, TerminationReason::TokenLimitReached);
        assert_eq!(result.text, "xxx");
        assert_eq!(result.tokens, 3);
        assert!(result.is_success());
    }

    #[test]
    fn test_zero_cap_is_unbounded() {
        let lp = GenerationLoop::new().with_max_tokens(Some(0));
        assert_eq!(lp.max_tokens(), None);
    }

    #[test]
    fn test_leading_marker_only_on_empty_cache() {
        let mut e = engine(64).with_reply(&["a"]).with_reply(&["b"]);
        let lp = GenerationLoop::new();
        run(&lp, &mut e, "one");
        run(&lp, &mut e, "two");
        assert_eq!(e.leading_marker_flags(), vec![true, false]);
    }

    #[test]
    fn test_resumed_cache_skips_leading_marker() {
        let mut e = engine(64).with_used(5).with_reply(&["a"]);
        run(&GenerationLoop::new(), &mut e, "x");
        assert_eq!(e.leading_marker_flags(), vec![false]);
    }

    #[test]
    fn test_context_exhausted_on_prompt() {
        // marker + 9 chars = 10 pending against capacity 10.
        let mut e = engine(10).with_reply(&["a"]);
        let result = run(&GenerationLoop::new(), &mut e, "123456789");
        assert_eq!(result.reason, TerminationReason::ContextExhausted);
        assert!(result.text.is_empty());
        assert_eq!(e.advance_calls(), 0);
        assert!(matches!(
            result.into_reply().unwrap_err(),
            ChatError::ContextExhausted {
                used: 0,
                pending: 10,
                capacity: 10
            }
        ));
    }

    #[test]
    fn test_context_exhausted_mid_reply_discards_text() {
        // Prompt uses 4 cells; each generated token needs one more.
        let mut e = engine(7).with_endless("z");
        let result = run(&GenerationLoop::new(), &mut e, "abc");
        assert_eq!(result.reason, TerminationReason::ContextExhausted);
        assert!(result.text.is_empty());
        assert_eq!(result.tokens, 3);
        assert_eq!(e.cache_used(), 6);
    }

    #[test]
    fn test_engine_error_discards_partial_reply() {
        let mut e = engine(64).with_reply(&["a", "b", "c"]).fail_on_advance(3);
        let result = run(&GenerationLoop::new(), &mut e, "q");
        assert_eq!(result.reason, TerminationReason::EngineError);
        assert!(result.text.is_empty());
        assert_eq!(result.tokens, 2);
        assert!(matches!(result.into_reply(), Err(ChatError::Engine(_))));
    }

    #[test]
    fn test_encode_error_is_returned() {
        let mut e = engine(64);
        let err = GenerationLoop::new()
            .generate(&mut e, "bad\0input", &mut |_: &str| {})
            .unwrap_err();
        assert!(matches!(err, ChatError::Encode(_)));
        assert_eq!(e.advance_calls(), 0);
    }

    #[test]
    fn test_empty_prompt_is_engine_error() {
        let mut e = engine(64).with_used(3);
        let result = run(&GenerationLoop::new(), &mut e, "");
        assert_eq!(result.reason, TerminationReason::EngineError);
        assert_eq!(e.advance_calls(), 0);
    }

    #[test]
    fn test_cancellation_after_token() {
        let mut e = engine(64).with_endless("y");
        let lp = GenerationLoop::new();
        let flag = lp.cancel_flag().clone();
        let result = lp
            .generate(&mut e, "go", &mut |_: &str| flag.cancel())
            .unwrap();
        assert_eq!(result.reason, TerminationReason::Cancelled);
        assert!(result.text.is_empty());
        assert_eq!(result.tokens, 1);
        assert!(matches!(result.into_reply(), Err(ChatError::Cancelled)));
    }

    #[test]
    fn test_stale_cancel_is_cleared_at_start() {
        let mut e = engine(64).with_reply(&["ok"]);
        let lp = GenerationLoop::new();
        lp.cancel_flag().cancel();
        let result = run(&lp, &mut e, "go");
        assert_eq!(result.reason, TerminationReason::EndOfGeneration);
        assert_eq!(result.text, "ok");
    }

    #[test]
    fn test_empty_and_control_pieces_kept_verbatim() {
        let mut e = engine(64).with_reply(&["", "a\u{7}", "\n"]);
        let result = run(&GenerationLoop::new(), &mut e, "go");
        assert_eq!(result.text, "a\u{7}\n");
        assert_eq!(result.tokens, 3);
    }

    #[test]
    fn test_placeholder_sanitize() {
        let mut e = engine(64).with_reply(&["a\u{7}b", "\tc\n", "\u{1b}"]);
        let lp = GenerationLoop::new().with_sanitize(SanitizePolicy::Placeholder('?'));
        let result = run(&lp, &mut e, "go");
        assert_eq!(result.text, "a?b\tc\n?");
    }

    #[test]
    fn test_sanitize_borrows_clean_text() {
        let policy = SanitizePolicy::Placeholder('?');
        assert!(matches!(policy.apply("clean"), Cow::Borrowed(_)));
        assert_eq!(SanitizePolicy::Verbatim.apply("\u{0}"), "\u{0}");
    }

    #[test]
    fn test_multibyte_reply_split_over_byte_tokens() {
        let mut e = engine(64).with_byte_reply("ok 💯".as_bytes());
        let mut streamed = String::new();
        let result = GenerationLoop::new()
            .generate(&mut e, "hi", &mut |p: &str| streamed.push_str(p))
            .unwrap();
        assert_eq!(result.reason, TerminationReason::EndOfGeneration);
        assert_eq!(result.text, "ok 💯");
        assert_eq!(streamed, "ok 💯");
        assert!(!result.text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_incomplete_character_flushed_at_end() {
        let mut e = engine(64).with_byte_reply(&[b'a', 0xF0, 0x9F]);
        let result = run(&GenerationLoop::new(), &mut e, "hi");
        assert_eq!(result.text, "a\u{FFFD}");
    }

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(TerminationReason::EndOfGeneration.to_string(), "end_of_generation");
        assert_eq!(TerminationReason::ContextExhausted.to_string(), "context_exhausted");
        assert!(!TerminationReason::Cancelled.is_success());
        assert!(!TerminationReason::EngineError.is_success());
    }
}
