//! Turn formatter: renders the conversation through the engine's template.
//!
//! The engine reports the rendered length rather than guaranteeing a fit, so
//! rendering is measure-then-fill: one call into the reusable buffer, and if the
//! reported length does not fit, one retry after growing the buffer.

use neura_core::types::ConversationEntry;
use neura_engine::InferenceEngine;

use crate::error::ChatError;

/// Reusable render buffer plus the two-phase sizing protocol.
#[derive(Debug, Clone)]
pub struct TurnFormatter {
    buf: Vec<u8>,
}

impl TurnFormatter {
    /// Start with a buffer of `capacity` bytes. It grows on demand.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buf.len()
    }

    /// Render `history`, appending the generation prompt when requested.
    ///
    /// # Errors
    /// `ChatError::Template` when the engine fails, when the retried call
    /// still does not fit, or when the output is not valid UTF-8.
    pub fn render<E: InferenceEngine + ?Sized>(
        &mut self,
        engine: &E,
        history: &[ConversationEntry],
        add_generation_prompt: bool,
    ) -> Result<String, ChatError> {
        let mut len = engine.render_template(history, add_generation_prompt, &mut self.buf)?;

        if len > self.buf.len() {
            tracing::debug!(
                from = self.buf.len(),
                to = len,
                "Growing template buffer"
            );
            self.buf.resize(len, 0);
            len = engine.render_template(history, add_generation_prompt, &mut self.buf)?;
            if len > self.buf.len() {
                return Err(ChatError::Template(format!(
                    "engine asked for {} bytes after resizing to {}",
                    len,
                    self.buf.len()
                )));
            }
        }

        String::from_utf8(self.buf[..len].to_vec())
            .map_err(|e| ChatError::Template(format!("rendered text is not UTF-8: {}", e)))
    }
}

impl Default for TurnFormatter {
    fn default() -> Self {
        Self::with_capacity(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neura_core::error::NeuraError;
    use neura_core::types::Token;
    use neura_engine::{ChatTemplate, MockEngine};

    fn engine() -> MockEngine {
        MockEngine::new(ChatTemplate::plain("angle").with_user("<", ">"), 64)
    }

    fn history() -> Vec<ConversationEntry> {
        vec![
            ConversationEntry::system("S"),
            ConversationEntry::user("hello"),
        ]
    }

    /// Always claims to need one byte more than it is given.
    struct NeverFits;

    impl InferenceEngine for NeverFits {
        fn render_template(
            &self,
            _history: &[ConversationEntry],
            _add_generation_prompt: bool,
            buf: &mut [u8],
        ) -> Result<usize, NeuraError> {
            Ok(buf.len() + 1)
        }
        fn encode(&self, _: &str, _: bool, _: bool) -> Result<Vec<Token>, NeuraError> {
            Ok(Vec::new())
        }
        fn cache_used(&self) -> usize {
            0
        }
        fn capacity(&self) -> usize {
            0
        }
        fn advance(&mut self, _: &[Token]) -> Result<(), NeuraError> {
            Ok(())
        }
        fn sample_next(&mut self) -> Token {
            Token(0)
        }
        fn is_end_of_generation(&self, _: Token) -> bool {
            true
        }
        fn decode_to_text(&self, _: Token) -> String {
            String::new()
        }
    }

    #[test]
    fn test_render_fits_first_time() {
        let mut f = TurnFormatter::with_capacity(64);
        let text = f.render(&engine(), &history(), true).unwrap();
        assert_eq!(text, "S<hello>");
        assert_eq!(f.buffer_capacity(), 64);
    }

    #[test]
    fn test_render_grows_small_buffer() {
        let mut f = TurnFormatter::with_capacity(2);
        let text = f.render(&engine(), &history(), true).unwrap();
        assert_eq!(text, "S<hello>");
        assert_eq!(f.buffer_capacity(), 8);
    }

    #[test]
    fn test_render_zero_capacity_buffer() {
        let mut f = TurnFormatter::with_capacity(0);
        assert_eq!(f.render(&engine(), &history(), false).unwrap(), "S<hello>");
    }

    #[test]
    fn test_render_is_deterministic() {
        let mut f = TurnFormatter::default();
        let e = engine();
        let a = f.render(&e, &history(), true).unwrap();
        let b = f.render(&e, &history(), true).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn test_render_shrinking_history_uses_prefix_only() {
        let mut f = TurnFormatter::default();
        let e = engine();
        let mut long = history();
        long.push(ConversationEntry::user("a much longer follow-up"));
        f.render(&e, &long, true).unwrap();
        assert_eq!(f.render(&e, &history(), true).unwrap(), "S<hello>");
    }

    #[test]
    fn test_render_engine_failure_is_template_error() {
        let mut f = TurnFormatter::default();
        let e = engine().with_broken_template();
        let err = f.render(&e, &history(), true).unwrap_err();
        assert!(matches!(err, ChatError::Template(_)));
    }

    #[test]
    fn test_render_retry_still_too_small() {
        let mut f = TurnFormatter::with_capacity(4);
        let err = f.render(&NeverFits, &history(), true).unwrap_err();
        assert!(matches!(err, ChatError::Template(_)));
        assert!(err.to_string().contains("after resizing"));
    }
}
