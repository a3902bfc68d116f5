//! Deterministic in-process engine.
//!
//! Used by the test suites and by the binary when it is built without a real
//! backend. Encoding is one token per character, sampling follows a script of
//! reply pieces, and every submitted batch is recorded for inspection.

use std::cell::RefCell;
use std::collections::VecDeque;

use neura_core::error::NeuraError;
use neura_core::types::{ConversationEntry, Token};

use crate::template::ChatTemplate;
use crate::utf8::Utf8Assembler;
use crate::InferenceEngine;

const END_OF_GENERATION: Token = Token(-1);
const LEADING_MARKER: Token = Token(-2);
/// Sampled pieces live above the Unicode scalar range used for characters.
const PIECE_BASE: i32 = 0x20_0000;
/// Raw byte tokens, as produced by byte-fallback vocabularies.
const BYTE_BASE: i32 = 0x40_0000;

/// Scripted mock engine.
#[derive(Debug)]
pub struct MockEngine {
    template: ChatTemplate,
    capacity: usize,
    used: usize,
    pieces: Vec<String>,
    script: VecDeque<Token>,
    endless: Option<Token>,
    fallback: Vec<Token>,
    template_broken: bool,
    fail_on_advance: Option<usize>,
    advance_calls: usize,
    submitted: Vec<Vec<Token>>,
    marker_flags: RefCell<Vec<bool>>,
    utf8: RefCell<Utf8Assembler>,
}

impl MockEngine {
    /// Create a mock with the given template and cache capacity.
    ///
    /// When its script runs dry the mock answers `[mock response]`.
    pub fn new(template: ChatTemplate, capacity: usize) -> Self {
        let mut engine = Self {
            template,
            capacity,
            used: 0,
            pieces: Vec::new(),
            script: VecDeque::new(),
            endless: None,
            fallback: Vec::new(),
            template_broken: false,
            fail_on_advance: None,
            advance_calls: 0,
            submitted: Vec::new(),
            marker_flags: RefCell::new(Vec::new()),
            utf8: RefCell::new(Utf8Assembler::new()),
        };
        let open = engine.intern("[mock");
        let close = engine.intern(" response]");
        engine.fallback = vec![open, close];
        engine
    }

    /// Queue one reply: its pieces followed by the end-of-generation marker.
    pub fn with_reply(mut self, pieces: &[&str]) -> Self {
        self.push_reply(pieces);
        self
    }

    /// Queue one reply on an existing engine.
    pub fn push_reply(&mut self, pieces: &[&str]) {
        for piece in pieces {
            let token = self.intern(piece);
            self.script.push_back(token);
        }
        self.script.push_back(END_OF_GENERATION);
    }

    /// Queue one reply sent as one token per byte, then end-of-generation.
    pub fn with_byte_reply(mut self, bytes: &[u8]) -> Self {
        self.script
            .extend(bytes.iter().map(|&b| Token(BYTE_BASE + i32::from(b))));
        self.script.push_back(END_OF_GENERATION);
        self
    }

    /// Once the script is exhausted, produce `piece` forever.
    pub fn with_endless(mut self, piece: &str) -> Self {
        self.endless = Some(self.intern(piece));
        self
    }

    /// Start with `used` cells already occupied, as if resuming a session.
    pub fn with_used(mut self, used: usize) -> Self {
        self.used = used;
        self
    }

    /// Make the `call`-th advance (1-based) fail.
    pub fn fail_on_advance(mut self, call: usize) -> Self {
        self.fail_on_advance = Some(call);
        self
    }

    /// Make every template render fail.
    pub fn with_broken_template(mut self) -> Self {
        self.template_broken = true;
        self
    }

    pub fn set_template_broken(&mut self, broken: bool) {
        self.template_broken = broken;
    }

    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    /// Every batch passed to `advance`, in order.
    pub fn submitted(&self) -> &[Vec<Token>] {
        &self.submitted
    }

    pub fn advance_calls(&self) -> usize {
        self.advance_calls
    }

    /// The `add_leading_marker` flag of every `encode` call, in order.
    pub fn leading_marker_flags(&self) -> Vec<bool> {
        self.marker_flags.borrow().clone()
    }

    /// Decode a whole batch back into text, skipping markers.
    pub fn text_of(&self, batch: &[Token]) -> String {
        batch.iter().map(|t| self.decode_to_text(*t)).collect()
    }

    fn intern(&mut self, piece: &str) -> Token {
        let idx = match self.pieces.iter().position(|p| p == piece) {
            Some(idx) => idx,
            None => {
                self.pieces.push(piece.to_string());
                self.pieces.len() - 1
            }
        };
        Token(PIECE_BASE + idx as i32)
    }
}

impl InferenceEngine for MockEngine {
    fn render_template(
        &self,
        history: &[ConversationEntry],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, NeuraError> {
        if self.template_broken {
            return Err(NeuraError::Template(format!(
                "template '{}' could not be applied",
                self.template.name
            )));
        }
        Ok(self
            .template
            .render_into(history, add_generation_prompt, buf))
    }

    fn encode(
        &self,
        text: &str,
        add_leading_marker: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, NeuraError> {
        if text.contains('\0') {
            return Err(NeuraError::Encode(
                "input contains an interior NUL byte".to_string(),
            ));
        }
        self.marker_flags.borrow_mut().push(add_leading_marker);

        let mut tokens = Vec::with_capacity(text.chars().count() + 1);
        if add_leading_marker {
            tokens.push(LEADING_MARKER);
        }
        tokens.extend(text.chars().map(|c| Token(c as i32)));
        Ok(tokens)
    }

    fn cache_used(&self) -> usize {
        self.used
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn advance(&mut self, batch: &[Token]) -> Result<(), NeuraError> {
        self.advance_calls += 1;
        if self.fail_on_advance == Some(self.advance_calls) {
            return Err(NeuraError::Inference(format!(
                "mock decode failure on call {}",
                self.advance_calls
            )));
        }
        self.used += batch.len();
        self.submitted.push(batch.to_vec());
        tracing::trace!(batch = batch.len(), used = self.used, "Mock advance");
        Ok(())
    }

    fn sample_next(&mut self) -> Token {
        if let Some(token) = self.script.pop_front() {
            return token;
        }
        if let Some(token) = self.endless {
            return token;
        }
        self.script.extend(self.fallback.iter().copied());
        self.script.push_back(END_OF_GENERATION);
        self.script.pop_front().unwrap_or(END_OF_GENERATION)
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == END_OF_GENERATION
    }

    fn decode_to_text(&self, token: Token) -> String {
        if token.0 >= BYTE_BASE {
            let byte = u8::try_from(token.0 - BYTE_BASE).unwrap_or(b'?');
            return self.utf8.borrow_mut().push(&[byte]);
        }
        if token.0 >= PIECE_BASE {
            return self
                .pieces
                .get((token.0 - PIECE_BASE) as usize)
                .cloned()
                .unwrap_or_default();
        }
        u32::try_from(token.0)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    }

    fn finish_text(&mut self) -> String {
        self.utf8.get_mut().finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MockEngine {
        MockEngine::new(ChatTemplate::plain("plain").with_user("<", ">"), 64)
    }

    #[test]
    fn test_encode_with_and_without_marker() {
        let e = engine();
        let first = e.encode("ab", true, true).unwrap();
        assert_eq!(first, vec![LEADING_MARKER, Token('a' as i32), Token('b' as i32)]);
        let later = e.encode("ab", false, true).unwrap();
        assert_eq!(later.len(), 2);
        assert_eq!(e.leading_marker_flags(), vec![true, false]);
    }

    #[test]
    fn test_encode_rejects_nul() {
        let e = engine();
        let err = e.encode("a\0b", false, true).unwrap_err();
        assert!(matches!(err, NeuraError::Encode(_)));
        assert!(e.leading_marker_flags().is_empty());
    }

    #[test]
    fn test_scripted_reply_then_eog() {
        let mut e = engine().with_reply(&["h", "i"]);
        let a = e.sample_next();
        let b = e.sample_next();
        let c = e.sample_next();
        assert_eq!(e.decode_to_text(a), "h");
        assert_eq!(e.decode_to_text(b), "i");
        assert!(e.is_end_of_generation(c));
    }

    #[test]
    fn test_fallback_reply_when_script_empty() {
        let mut e = engine();
        let mut text = String::new();
        loop {
            let t = e.sample_next();
            if e.is_end_of_generation(t) {
                break;
            }
            text.push_str(&e.decode_to_text(t));
        }
        assert_eq!(text, "[mock response]");
    }

    #[test]
    fn test_endless_never_ends() {
        let mut e = engine().with_endless("x");
        for _ in 0..100 {
            let t = e.sample_next();
            assert!(!e.is_end_of_generation(t));
            assert_eq!(e.decode_to_text(t), "x");
        }
    }

    #[test]
    fn test_advance_tracks_usage_and_failure() {
        let mut e = engine().with_used(5).fail_on_advance(2);
        e.advance(&[Token(1), Token(2)]).unwrap();
        assert_eq!(e.cache_used(), 7);
        assert!(e.advance(&[Token(3)]).is_err());
        assert_eq!(e.cache_used(), 7);
        assert_eq!(e.advance_calls(), 2);
        assert_eq!(e.submitted().len(), 1);
    }

    #[test]
    fn test_render_template_broken() {
        let e = engine().with_broken_template();
        let mut buf = [0u8; 16];
        let err = e
            .render_template(&[ConversationEntry::user("x")], true, &mut buf)
            .unwrap_err();
        assert!(matches!(err, NeuraError::Template(_)));
    }

    #[test]
    fn test_byte_reply_reassembles_characters() {
        let mut e = engine().with_byte_reply("é!".as_bytes());
        let mut pieces = Vec::new();
        loop {
            let t = e.sample_next();
            if e.is_end_of_generation(t) {
                break;
            }
            pieces.push(e.decode_to_text(t));
        }
        assert_eq!(pieces, vec!["", "é", "!"]);
        assert_eq!(e.finish_text(), "");
    }

    #[test]
    fn test_finish_text_flushes_partial_bytes() {
        let mut e = engine().with_byte_reply(&[0xE2, 0x82]);
        let a = e.sample_next();
        let b = e.sample_next();
        assert_eq!(e.decode_to_text(a), "");
        assert_eq!(e.decode_to_text(b), "");
        assert_eq!(e.finish_text(), "\u{FFFD}");
    }

    #[test]
    fn test_text_of_skips_markers() {
        let e = engine();
        let tokens = e.encode("hey", true, true).unwrap();
        assert_eq!(e.text_of(&tokens), "hey");
    }
}
