pub mod config;
pub mod error;
pub mod types;

pub use config::NeuraConfig;
pub use error::{NeuraError, Result};
pub use types::*;
