//! Reassembles text from token byte pieces.
//!
//! Byte-fallback vocabularies split one character over several tokens, so a
//! single token's bytes are not always valid UTF-8 on their own. Incomplete
//! sequences are held back until the bytes that finish them arrive.

/// Buffer of bytes that do not yet form a complete character.
#[derive(Debug, Clone, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bytes` and return every character now complete.
    ///
    /// Bytes that can never start or continue a valid sequence become
    /// U+FFFD; a trailing incomplete sequence is kept for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left, lossily, and start over.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
