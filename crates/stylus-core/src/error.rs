//! Error types for stylus.

use thiserror::Error;

/// Result type alias for stylus operations.
pub type Result<T> = std::result::Result<T, StylusError>;

/// Main error type for stylus operations.
#[derive(Error, Debug)]
pub enum StylusError {
    /// Configuration errors. Raised at startup and never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint read/write errors.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Training errors that abort the run.
    #[error("Training error: {0}")]
    Training(String),

    /// A unit name that is not present in the registry.
    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MLX backend errors.
    #[error("MLX error: {0}")]
    Mlx(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
