//! Audio processing utilities.
//!
//! This module provides MLX-native implementations of:
//! - STFT power spectra
//! - Mel filterbanks, mel spectrograms and log-norm energy
//! - Linear resampling

mod mel;
mod resample;
mod stft;

pub use mel::*;
pub use resample::*;
pub use stft::*;
