//! Error types for the audio crate.

use mlx_rs::error::Exception;
use thiserror::Error;

/// Result type for audio operations.
pub type Result<T> = std::result::Result<T, AudioError>;

/// Error type for audio operations.
#[derive(Error, Debug)]
pub enum AudioError {
    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input shorter than the transform requires.
    #[error("Signal too short: {len} samples, need more than {required}")]
    SignalTooShort {
        /// Samples available.
        len: i32,
        /// Samples required.
        required: i32,
    },
}

impl From<AudioError> for Exception {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::Mlx(e) => e,
            other => Exception::custom(other.to_string()),
        }
    }
}
