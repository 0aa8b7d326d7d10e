use std::io;

use crate::config::ConfigError;
use crate::coordinator::CoordinatorError;

/// Errors surfaced by the `roomkeeper` binary
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Config rendering error: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
