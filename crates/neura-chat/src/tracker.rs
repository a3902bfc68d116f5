//! Incremental prompt tracking.
//!
//! The engine keeps already-processed text in its cache, so each turn only
//! submits the part of the rendered transcript past the cursor. The cursor
//! never moves backwards and never points past the render it was taken from.

use crate::error::ChatError;

/// Byte offset into the rendered transcript already consumed by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptCursor {
    last_rendered_len: usize,
}

impl PromptCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.last_rendered_len
    }

    /// The submission slice `[position, rendered.len())`.
    ///
    /// # Errors
    /// `ChatError::Template` if the render is shorter than the cursor or the
    /// cursor does not fall on a character boundary; both mean the history
    /// no longer renders as an extension of what was submitted.
    pub fn pending<'a>(&self, rendered: &'a str) -> Result<&'a str, ChatError> {
        let start = self.last_rendered_len;
        if start > rendered.len() {
            return Err(ChatError::Template(format!(
                "rendered transcript ({} bytes) is shorter than the consumed prefix ({} bytes)",
                rendered.len(),
                start
            )));
        }
        rendered.get(start..).ok_or_else(|| {
            ChatError::Template(format!(
                "consumed prefix ends inside a character at byte {}",
                start
            ))
        })
    }

    /// Move the cursor to `new_len`.
    ///
    /// # Errors
    /// `ChatError::Template` if `new_len` is behind the current position.
    pub fn advance_to(&mut self, new_len: usize) -> Result<(), ChatError> {
        if new_len < self.last_rendered_len {
            return Err(ChatError::Template(format!(
                "cursor cannot move back from {} to {}",
                self.last_rendered_len, new_len
            )));
        }
        tracing::debug!(from = self.last_rendered_len, to = new_len, "Prompt cursor advanced");
        self.last_rendered_len = new_len;
        Ok(())
    }
}
