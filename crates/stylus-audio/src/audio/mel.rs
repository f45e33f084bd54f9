//! Mel filterbank, mel spectrogram and log-norm energy.

use mlx_rs::Array;

use crate::audio::{stft_power, StftConfig};
use crate::error::Result;

/// Mel filterbank configuration.
#[derive(Debug, Clone)]
pub struct MelConfig {
    /// Sampling rate in Hz.
    pub sr: i32,
    /// Number of FFT bins.
    pub n_fft: i32,
    /// Number of mel frequency bins.
    pub n_mels: i32,
    /// Minimum frequency in Hz.
    pub fmin: f32,
    /// Maximum frequency in Hz (defaults to sr/2).
    pub fmax: Option<f32>,
    /// Whether to use HTK formula (vs Slaney).
    pub htk: bool,
    /// Normalization type for filterbank.
    pub norm: MelNorm,
}

/// Mel filterbank normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MelNorm {
    /// No normalization.
    #[default]
    None,
    /// Slaney-style normalization (area = 1).
    Slaney,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sr: 24000,
            n_fft: 1024,
            n_mels: 128,
            fmin: 0.0,
            fmax: None,
            htk: true,
            norm: MelNorm::None,
        }
    }
}

/// Convert frequency in Hz to mel scale.
///
/// # Arguments
/// * `freq` - Frequency in Hz
/// * `htk` - Use HTK formula if true, Slaney otherwise
pub fn hz_to_mel(freq: f32, htk: bool) -> f32 {
    if htk {
        2595.0 * (1.0 + freq / 700.0).log10()
    } else {
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let logstep = (6.4f32).ln() / 27.0;

        if freq >= min_log_hz {
            min_log_mel + (freq / min_log_hz).ln() / logstep
        } else {
            freq / f_sp
        }
    }
}

/// Convert mel scale to frequency in Hz.
pub fn mel_to_hz(mel: f32, htk: bool) -> f32 {
    if htk {
        700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
    } else {
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let logstep = (6.4f32).ln() / 27.0;

        if mel >= min_log_mel {
            min_log_hz * ((mel - min_log_mel) * logstep).exp()
        } else {
            f_sp * mel
        }
    }
}

/// Create mel filterbank matrix.
///
/// Triangles are evaluated on the linear frequency grid of the FFT bins.
/// `norm` selects optional Slaney area normalization.
///
/// # Returns
/// Mel filterbank matrix `[n_mels, n_fft/2+1]`
pub fn mel_filterbank(config: &MelConfig) -> Array {
    let fmax = config.fmax.unwrap_or(config.sr as f32 / 2.0);
    let n_freqs = (config.n_fft / 2 + 1) as usize;
    let n_mels = config.n_mels as usize;

    let all_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| (config.sr as f32 / 2.0) * k as f32 / (n_freqs.max(2) - 1) as f32)
        .collect();

    let mel_min = hz_to_mel(config.fmin, config.htk);
    let mel_max = hz_to_mel(fmax, config.htk);
    let f_pts: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .map(|m| mel_to_hz(m, config.htk))
        .collect();

    let mut filterbank = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let lower = f_pts[m + 1] - f_pts[m];
        let upper = f_pts[m + 2] - f_pts[m + 1];
        let enorm = match config.norm {
            MelNorm::Slaney => 2.0 / (f_pts[m + 2] - f_pts[m]),
            MelNorm::None => 1.0,
        };
        for (k, &freq) in all_freqs.iter().enumerate() {
            let down = (freq - f_pts[m]) / lower;
            let up = (f_pts[m + 2] - freq) / upper;
            filterbank[m * n_freqs + k] = down.min(up).max(0.0) * enorm;
        }
    }

    Array::from_slice(&filterbank, &[config.n_mels, n_freqs as i32])
}

/// Compute a power mel spectrogram.
///
/// # Returns
/// Mel spectrogram `[batch, n_mels, frames]`
pub fn mel_spectrogram(audio: &Array, config: &MelConfig, stft_config: &StftConfig) -> Result<Array> {
    let power = stft_power(audio, stft_config)?;
    let mel_fb = mel_filterbank(config);
    Ok(mel_fb.matmul(&power)?)
}

/// Log-norm energy of a normalized log-mel spectrogram.
///
/// `ln ‖exp(mel * 4 - 4)‖₂` over the mel axis, undoing the `(ln(x) + 4) / 4`
/// normalisation applied by the feature front end.
///
/// # Arguments
/// * `mel` - `[batch, n_mels, frames]`
///
/// # Returns
/// Energy `[batch, frames]`
pub fn log_norm(mel: &Array) -> Result<Array> {
    let linear = mel
        .multiply(&Array::from_f32(4.0))?
        .subtract(&Array::from_f32(4.0))?
        .exp()?;
    let norm = linear.square()?.sum_axis(1, None)?.sqrt()?;
    Ok(norm.log()?)
}
