//! Spectral features and adversarial waveform losses on MLX.
//!
//! Everything here is differentiable so that it can sit inside a
//! `keyed_value_and_grad` closure:
//!
//! - Framed STFT power through a real DFT basis
//! - HTK mel filterbanks and log-norm energy
//! - Linear resampling between sample rates
//! - LSGAN, feature matching and truncated pointwise relativistic losses
//! - Multi-resolution STFT spectral convergence loss

#![allow(clippy::needless_borrows_for_generic_args)]

pub mod audio;
pub mod error;
pub mod loss;

pub use error::*;
