//! Chat template presets.
//!
//! A template wraps each entry's content in role-specific markers and may
//! append a generation prompt that opens the assistant's next turn.
//! Rendering is a pure function of the history, so rendering a history is
//! always a prefix of rendering any extension of it.

use neura_core::types::{ConversationEntry, Role};

/// Text placed around an entry's content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleMarkers {
    pub prefix: String,
    pub suffix: String,
}

impl RoleMarkers {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

/// Role-marker chat template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    pub name: String,
    pub system: RoleMarkers,
    pub user: RoleMarkers,
    pub assistant: RoleMarkers,
    /// Appended when a generation prompt is requested.
    pub generation_prompt: String,
}

impl ChatTemplate {
    /// A template that renders every entry's content bare.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system: RoleMarkers::default(),
            user: RoleMarkers::default(),
            assistant: RoleMarkers::default(),
            generation_prompt: String::new(),
        }
    }

    /// Mistral instruct format: `[INST] ... [/INST]` user turns, replies closed by `</s>`.
    pub fn mistral() -> Self {
        Self {
            name: "mistral".to_string(),
            system: RoleMarkers::new("", "\n"),
            user: RoleMarkers::new("[INST] ", " [/INST]"),
            assistant: RoleMarkers::new("", "</s>"),
            generation_prompt: String::new(),
        }
    }

    pub fn chatml() -> Self {
        Self {
            name: "chatml".to_string(),
            system: RoleMarkers::new("<|im_start|>system\n", "<|im_end|>\n"),
            user: RoleMarkers::new("<|im_start|>user\n", "<|im_end|>\n"),
            assistant: RoleMarkers::new("<|im_start|>assistant\n", "<|im_end|>\n"),
            generation_prompt: "<|im_start|>assistant\n".to_string(),
        }
    }

    pub fn llama3() -> Self {
        Self {
            name: "llama3".to_string(),
            system: RoleMarkers::new(
                "<|start_header_id|>system<|end_header_id|>\n\n",
                "<|eot_id|>",
            ),
            user: RoleMarkers::new("<|start_header_id|>user<|end_header_id|>\n\n", "<|eot_id|>"),
            assistant: RoleMarkers::new(
                "<|start_header_id|>assistant<|end_header_id|>\n\n",
                "<|eot_id|>",
            ),
            generation_prompt: "<|start_header_id|>assistant<|end_header_id|>\n\n".to_string(),
        }
    }

    /// Look up a preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "mistral" => Some(Self::mistral()),
            "chatml" => Some(Self::chatml()),
            "llama3" => Some(Self::llama3()),
            _ => None,
        }
    }

    pub fn with_system(mut self, prefix: &str, suffix: &str) -> Self {
        self.system = RoleMarkers::new(prefix, suffix);
        self
    }

    pub fn with_user(mut self, prefix: &str, suffix: &str) -> Self {
        self.user = RoleMarkers::new(prefix, suffix);
        self
    }

    pub fn with_assistant(mut self, prefix: &str, suffix: &str) -> Self {
        self.assistant = RoleMarkers::new(prefix, suffix);
        self
    }

    pub fn with_generation_prompt(mut self, prompt: &str) -> Self {
        self.generation_prompt = prompt.to_string();
        self
    }

    fn markers(&self, role: Role) -> &RoleMarkers {
        match role {
            Role::System => &self.system,
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }

    /// Render the full transcript.
    pub fn render(&self, history: &[ConversationEntry], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        for entry in history {
            let markers = self.markers(entry.role());
            out.push_str(&markers.prefix);
            out.push_str(entry.content());
            out.push_str(&markers.suffix);
        }
        if add_generation_prompt {
            out.push_str(&self.generation_prompt);
        }
        out
    }

    /// Measure-then-fill rendering.
    ///
    /// Returns the rendered length. `buf` is only written when the rendering
    /// fits; a larger return value tells the caller how much to allocate.
    pub fn render_into(
        &self,
        history: &[ConversationEntry],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> usize {
        let rendered = self.render(history, add_generation_prompt);
        let bytes = rendered.as_bytes();
        if bytes.len() <= buf.len() {
            buf[..bytes.len()].copy_from_slice(bytes);
        }
        bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<ConversationEntry> {
        vec![
            ConversationEntry::system("S"),
            ConversationEntry::user("hello"),
        ]
    }

    #[test]
    fn test_custom_template_render() {
        let tmpl = ChatTemplate::plain("angle").with_user("<", ">");
        assert_eq!(tmpl.render(&history(), true), "S<hello>");
        assert_eq!(tmpl.render(&history(), false), "S<hello>");
    }

    #[test]
    fn test_mistral_render() {
        let mut h = history();
        h.push(ConversationEntry::assistant("hi"));
        assert_eq!(
            ChatTemplate::mistral().render(&h, false),
            "S\n[INST] hello [/INST]hi</s>"
        );
    }

    #[test]
    fn test_chatml_generation_prompt() {
        let tmpl = ChatTemplate::chatml();
        let with = tmpl.render(&history(), true);
        let without = tmpl.render(&history(), false);
        assert!(with.ends_with("<|im_start|>assistant\n"));
        assert_eq!(&with[..without.len()], without);
    }

    #[test]
    fn test_render_is_prefix_of_extension() {
        for name in ["mistral", "chatml", "llama3"] {
            let tmpl = ChatTemplate::preset(name).unwrap();
            let mut h = history();
            let before = tmpl.render(&h, false);
            h.push(ConversationEntry::assistant("sure"));
            h.push(ConversationEntry::user("more"));
            let after = tmpl.render(&h, true);
            assert!(after.starts_with(&before), "{name} is not prefix-stable");
        }
    }

    #[test]
    fn test_preset_unknown() {
        assert!(ChatTemplate::preset("alpaca").is_none());
    }

    #[test]
    fn test_render_into_measure_then_fill() {
        let tmpl = ChatTemplate::plain("angle").with_user("<", ">");
        let mut small = [0u8; 4];
        let needed = tmpl.render_into(&history(), true, &mut small);
        assert_eq!(needed, 8);
        assert_eq!(small, [0u8; 4]);

        let mut buf = vec![0u8; needed];
        assert_eq!(tmpl.render_into(&history(), true, &mut buf), 8);
        assert_eq!(&buf, b"S<hello>");
    }

    #[test]
    fn test_render_empty_history() {
        let tmpl = ChatTemplate::chatml();
        assert_eq!(tmpl.render(&[], false), "");
        assert_eq!(tmpl.render(&[], true), "<|im_start|>assistant\n");
    }
}
