use thiserror::Error;

/// Top-level error type shared by the Neura crates.
///
/// The engine crate reports backend failures through the `Template`, `Encode`
/// and `Inference` variants; the chat crate maps them onto its own per-turn
/// taxonomy. `ModelLoad` is only produced while acquiring a backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NeuraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Inference error: {0}")]
    Inference(String),
}

impl From<toml::de::Error> for NeuraError {
    fn from(err: toml::de::Error) -> Self {
        NeuraError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NeuraError {
    fn from(err: toml::ser::Error) -> Self {
        NeuraError::Config(err.to_string())
    }
}

/// A specialized `Result` type for Neura operations.
pub type Result<T> = std::result::Result<T, NeuraError>;
