use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NeuraError, Result};

/// Names accepted by `model.template`.
pub const TEMPLATE_PRESETS: &[&str] = &["mistral", "chatml", "llama3"];

/// Top-level configuration for the Neura chat shell.
///
/// Loaded from `~/.neura/config.toml` by default. Every section falls back to
/// its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeuraConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl NeuraConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NeuraConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file that may not exist.
    ///
    /// Returns `Ok(None)` for a missing file and an error for one that cannot
    /// be read or parsed. Logs nothing, so it can run before tracing is set up.
    pub fn load_if_present(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(toml::from_str(&content)?))
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.model.context_size == 0 {
            return Err(NeuraError::Config(
                "model.context_size must be greater than 0".to_string(),
            ));
        }
        if self.model.batch_size == 0 {
            return Err(NeuraError::Config(
                "model.batch_size must be greater than 0".to_string(),
            ));
        }
        if !TEMPLATE_PRESETS.contains(&self.model.template.as_str()) {
            return Err(NeuraError::Config(format!(
                "unknown template preset '{}' (expected one of: {})",
                self.model.template,
                TEMPLATE_PRESETS.join(", ")
            )));
        }
        if self.chat.exit_command.is_empty() {
            return Err(NeuraError::Config(
                "chat.exit_command cannot be empty".to_string(),
            ));
        }
        let s = &self.sampling;
        if !(0.0..=1.0).contains(&s.min_p) || !(0.0..=1.0).contains(&s.top_p) {
            return Err(NeuraError::Config(
                "sampling.min_p and sampling.top_p must be within [0, 1]".to_string(),
            ));
        }
        if s.temperature < 0.0 {
            return Err(NeuraError::Config(
                "sampling.temperature cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Model and backend context settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub path: String,
    /// Layers offloaded to the GPU.
    pub gpu_layers: u32,
    /// Context window in tokens.
    pub context_size: u32,
    /// Maximum tokens per decode batch.
    pub batch_size: u32,
    /// CPU threads for generation and batch processing.
    pub threads: i32,
    /// Template preset used when the model carries no chat template.
    pub template: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            gpu_layers: 21,
            context_size: 4096,
            batch_size: 2048,
            threads: 7,
            template: "mistral".to_string(),
        }
    }
}

/// Sampler chain settings, applied in field order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub min_p: f32,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    /// Seed for the final distribution sampler. Random when unset.
    pub seed: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_p: 0.05,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            seed: None,
        }
    }
}

/// How the rendered-prompt cursor moves after a successful turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPolicy {
    /// Stop before the reply so the next turn re-submits it through the template.
    #[default]
    ReplayReply,
    /// Move past the reply, treating the generated text as resident in the engine cache.
    AssumeResident,
}

/// Conversation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// First entry of every session.
    pub system_prompt: String,
    /// Input line that ends the session.
    pub exit_command: String,
    /// Per-turn token cap. 0 means unbounded.
    pub max_tokens: usize,
    /// Print reply pieces as they are generated.
    pub stream: bool,
    /// Replace control characters in replies with `placeholder`.
    pub sanitize: bool,
    pub placeholder: char,
    pub cursor_policy: CursorPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are Neura, a laid-back assistant who keeps it real. \
                            Talk casually, skip the corporate tone, and keep answers short \
                            unless asked for detail."
                .to_string(),
            exit_command: "exit".to_string(),
            max_tokens: 0,
            stream: true,
            sanitize: false,
            placeholder: '?',
            cursor_policy: CursorPolicy::ReplayReply,
        }
    }
}

impl ChatConfig {
    /// The token cap as an option, `None` meaning unbounded.
    pub fn token_limit(&self) -> Option<usize> {
        (self.max_tokens > 0).then_some(self.max_tokens)
    }
}
