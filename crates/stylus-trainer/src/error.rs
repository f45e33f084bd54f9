//! Error type for the trainer crate.

use mlx_rs::error::Exception;
use stylus_audio::AudioError;
use stylus_core::StylusError;
use thiserror::Error;

/// Errors that abort training.
///
/// Degenerate batches are not errors; see [`crate::SkipReason`].
#[derive(Error, Debug)]
pub enum TrainerError {
    /// MLX error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),
    /// Audio feature or loss error.
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    /// Configuration or core error.
    #[error(transparent)]
    Core(#[from] StylusError),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A unit name missing from the registry or optimizer.
    #[error("Unknown unit: {0}")]
    UnknownUnit(String),
    /// Checkpoint contents do not match the model.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    /// A unit returned outputs of the wrong arity or shape.
    #[error("Unit contract violated by {unit}: {message}")]
    Contract {
        /// Offending unit.
        unit: String,
        /// What was wrong.
        message: String,
    },
}

/// Result type for trainer operations.
pub type Result<T> = std::result::Result<T, TrainerError>;

impl TrainerError {
    /// Contract violation helper.
    pub fn contract(unit: &str, message: impl Into<String>) -> Self {
        Self::Contract {
            unit: unit.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error came from the configuration layer.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Core(StylusError::Config(_)))
    }
}

impl From<TrainerError> for Exception {
    fn from(err: TrainerError) -> Self {
        match err {
            TrainerError::Mlx(e) => e,
            other => Exception::custom(other.to_string()),
        }
    }
}
