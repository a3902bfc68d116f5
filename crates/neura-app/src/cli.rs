//! CLI argument definitions for the Neura chat binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::{Path, PathBuf};

use neura_core::{NeuraConfig, NeuraError};

/// Neura - an interactive terminal chat with a local language model.
#[derive(Parser, Debug, Default)]
#[command(name = "neura", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Path to the GGUF model file.
    #[arg(short = 'm', long = "model")]
    pub model: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Per-turn token cap; 0 lifts the cap.
    #[arg(short = 'n', long = "max-tokens")]
    pub max_tokens: Option<usize>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > NEURA_CONFIG env var > ~/.neura/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("NEURA_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the model path.
    ///
    /// Priority: --model flag > NEURA_MODEL env var > config file value.
    pub fn resolve_model_path(&self, config_path: &str) -> String {
        if let Some(ref p) = self.model {
            return p.to_string_lossy().to_string();
        }
        if let Ok(p) = std::env::var("NEURA_MODEL") {
            if !p.is_empty() {
                return p;
            }
        }
        config_path.to_string()
    }

    /// Fold the command-line overrides into a loaded configuration.
    pub fn apply(&self, config: &mut NeuraConfig) {
        config.model.path = self.resolve_model_path(&config.model.path);
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(max) = self.max_tokens {
            config.chat.max_tokens = max;
        }
    }
}

/// How the configuration file was found. Logged once tracing is running.
#[derive(Debug)]
pub enum ConfigLoad {
    Loaded,
    Missing,
    Failed(NeuraError),
}

impl ConfigLoad {
    pub fn log(&self, path: &Path) {
        match self {
            ConfigLoad::Loaded => tracing::info!(path = %path.display(), "Configuration loaded"),
            ConfigLoad::Missing => {
                tracing::info!(path = %path.display(), "No configuration file, using defaults")
            }
            ConfigLoad::Failed(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to load configuration, using defaults"
            ),
        }
    }
}

impl CliArgs {
    /// Read the configuration file and fold in the command-line overrides.
    ///
    /// Nothing is logged here; the outcome is returned so it can be reported
    /// after the subscriber is installed with the resolved log level.
    pub fn load_config(&self) -> (PathBuf, NeuraConfig, ConfigLoad) {
        let path = self.resolve_config_path();
        let (mut config, load) = match NeuraConfig::load_if_present(&path) {
            Ok(Some(config)) => (config, ConfigLoad::Loaded),
            Ok(None) => (NeuraConfig::default(), ConfigLoad::Missing),
            Err(e) => (NeuraConfig::default(), ConfigLoad::Failed(e)),
        };
        self.apply(&mut config);
        (path, config, load)
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".neura").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".neura").join("config.toml");
    }
    PathBuf::from("config.toml")
}
