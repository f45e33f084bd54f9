//! Multi-resolution spectral convergence on normalized log-mel spectra.

use mlx_rs::Array;

use crate::audio::{mel_filterbank, stft_power, MelConfig, StftConfig};
use crate::error::{AudioError, Result};

const LOG_MEL_EPS: f32 = 1e-5;
const LOG_MEL_MEAN: f32 = -4.0;
const LOG_MEL_STD: f32 = 4.0;

/// One analysis resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StftResolution {
    /// FFT size.
    pub n_fft: i32,
    /// Hop size in samples.
    pub hop_length: i32,
    /// Window length in samples.
    pub win_length: i32,
}

impl StftResolution {
    /// Construct a resolution.
    pub const fn new(n_fft: i32, hop_length: i32, win_length: i32) -> Self {
        Self {
            n_fft,
            hop_length,
            win_length,
        }
    }
}

/// Default resolutions `(n_fft, hop, win)`.
pub const DEFAULT_RESOLUTIONS: [StftResolution; 3] = [
    StftResolution::new(1024, 120, 600),
    StftResolution::new(2048, 240, 1200),
    StftResolution::new(512, 50, 240),
];

struct Analyzer {
    stft: StftConfig,
    filterbank: Array,
}

/// Spectral convergence `‖y - x‖₁ / ‖y‖₁` on `(ln(1e-5 + mel) + 4) / 4`,
/// averaged over several STFT resolutions.
pub struct MultiResolutionStftLoss {
    analyzers: Vec<Analyzer>,
}

impl std::fmt::Debug for MultiResolutionStftLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiResolutionStftLoss")
            .field("resolutions", &self.analyzers.len())
            .finish()
    }
}

impl MultiResolutionStftLoss {
    /// Loss at the default resolutions with 128 HTK mel bands.
    pub fn new(sample_rate: i32) -> Self {
        Self::with_resolutions(sample_rate, &DEFAULT_RESOLUTIONS, 128)
    }

    /// Loss at custom resolutions.
    pub fn with_resolutions(sample_rate: i32, resolutions: &[StftResolution], n_mels: i32) -> Self {
        let analyzers = resolutions
            .iter()
            .map(|r| Analyzer {
                stft: StftConfig::new(r.n_fft, r.hop_length, r.win_length),
                filterbank: mel_filterbank(&MelConfig {
                    sr: sample_rate,
                    n_fft: r.n_fft,
                    n_mels,
                    ..Default::default()
                }),
            })
            .collect();
        Self { analyzers }
    }

    /// Number of resolutions.
    pub fn num_resolutions(&self) -> usize {
        self.analyzers.len()
    }

    fn log_mel(analyzer: &Analyzer, signal: &Array) -> Result<Array> {
        let power = stft_power(signal, &analyzer.stft)?;
        let mel = analyzer.filterbank.matmul(&power)?;
        let log_mel = mel.add(&Array::from_f32(LOG_MEL_EPS))?.log()?;
        Ok(log_mel
            .subtract(&Array::from_f32(LOG_MEL_MEAN))?
            .divide(&Array::from_f32(LOG_MEL_STD))?)
    }

    /// Compute the loss.
    ///
    /// # Arguments
    /// * `generated` - `[batch, samples]`
    /// * `target` - `[batch, samples]`
    pub fn compute(&self, generated: &Array, target: &Array) -> Result<Array> {
        if self.analyzers.is_empty() {
            return Err(AudioError::Config("no STFT resolutions configured".into()));
        }
        let mut total = Array::from_f32(0.0);
        for analyzer in &self.analyzers {
            let x = Self::log_mel(analyzer, generated)?;
            let y = Self::log_mel(analyzer, target)?;
            let numerator = y.subtract(&x)?.abs()?.sum(None)?;
            let denominator = y.abs()?.sum(None)?;
            total = total.add(&numerator.divide(&denominator)?)?;
        }
        Ok(total.divide(&Array::from_f32(self.analyzers.len() as f32))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, samples: i32) -> Array {
        let values: Vec<f32> = (0..samples)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / 8000.0).sin() * 0.5)
            .collect();
        Array::from_slice(&values, &[1, samples])
    }

    fn small_loss() -> MultiResolutionStftLoss {
        MultiResolutionStftLoss::with_resolutions(
            8000,
            &[StftResolution::new(128, 32, 96), StftResolution::new(64, 16, 48)],
            16,
        )
    }

    #[test]
    fn test_identical_signals_have_zero_loss() {
        let loss = small_loss();
        let x = tone(440.0, 1024);
        let value = loss.compute(&x, &x).unwrap();
        value.eval().unwrap();
        assert!(value.item::<f32>().abs() < 1e-6);
    }

    #[test]
    fn test_different_signals_have_positive_loss() {
        let loss = small_loss();
        let value = loss.compute(&tone(440.0, 1024), &tone(1500.0, 1024)).unwrap();
        value.eval().unwrap();
        assert!(value.item::<f32>() > 0.01);
    }

    #[test]
    fn test_default_resolutions() {
        let loss = MultiResolutionStftLoss::new(24000);
        assert_eq!(loss.num_resolutions(), 3);
    }

    #[test]
    fn test_empty_resolutions_rejected() {
        let loss = MultiResolutionStftLoss::with_resolutions(8000, &[], 16);
        let x = tone(440.0, 256);
        assert!(loss.compute(&x, &x).is_err());
    }
}
