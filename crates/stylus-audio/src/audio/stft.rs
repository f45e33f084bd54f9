//! Short-Time Fourier Transform power spectra using MLX.
//!
//! The transform is a matmul against a real DFT basis rather than an FFT so
//! that gradients flow through it like any other dense op.

use mlx_rs::Array;

use crate::error::{AudioError, Result};

/// STFT configuration.
#[derive(Debug, Clone)]
pub struct StftConfig {
    /// FFT size.
    pub n_fft: i32,
    /// Hop size in samples.
    pub hop_length: i32,
    /// Window size (defaults to n_fft).
    pub win_length: Option<i32>,
    /// Whether to center the signal with padding.
    pub center: bool,
    /// Padding mode when centering.
    pub pad_mode: PadMode,
}

/// Padding modes for STFT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PadMode {
    /// Reflect padding (mirror).
    #[default]
    Reflect,
    /// Zero padding.
    Zeros,
    /// Replicate edge values.
    Replicate,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            n_fft: 1024,
            hop_length: 120,
            win_length: Some(600),
            center: true,
            pad_mode: PadMode::Reflect,
        }
    }
}

impl StftConfig {
    /// Configuration with an explicit resolution.
    pub fn new(n_fft: i32, hop_length: i32, win_length: i32) -> Self {
        Self {
            n_fft,
            hop_length,
            win_length: Some(win_length),
            ..Default::default()
        }
    }

    /// Number of frequency bins.
    pub fn n_freqs(&self) -> i32 {
        self.n_fft / 2 + 1
    }
}

/// Periodic Hann window values.
///
/// hann[n] = 0.5 * (1 - cos(2*pi*n / N))
pub fn hann_window_values(size: i32) -> Vec<f32> {
    let n = size.max(1) as f32;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n).cos()))
        .collect()
}

/// Window of `win_length` zero-padded symmetrically to `n_fft`.
fn padded_window(config: &StftConfig) -> Vec<f32> {
    let win_length = config.win_length.unwrap_or(config.n_fft).min(config.n_fft);
    let pad_left = ((config.n_fft - win_length) / 2) as usize;
    let mut window = vec![0.0f32; config.n_fft as usize];
    for (i, w) in hann_window_values(win_length).into_iter().enumerate() {
        window[pad_left + i] = w;
    }
    window
}

/// Windowed real DFT bases, each `[n_fft, n_freqs]`.
fn dft_bases(config: &StftConfig) -> (Array, Array) {
    let n_fft = config.n_fft as usize;
    let n_freqs = config.n_freqs() as usize;
    let window = padded_window(config);

    let mut cos_basis = vec![0.0f32; n_fft * n_freqs];
    let mut sin_basis = vec![0.0f32; n_fft * n_freqs];
    let step = 2.0 * std::f64::consts::PI / n_fft as f64;
    for k in 0..n_fft {
        for f in 0..n_freqs {
            // (k * f) mod n_fft keeps the phase argument small.
            let phase = step * ((k * f) % n_fft) as f64;
            cos_basis[k * n_freqs + f] = window[k] * phase.cos() as f32;
            sin_basis[k * n_freqs + f] = window[k] * phase.sin() as f32;
        }
    }

    let shape = [config.n_fft, config.n_freqs()];
    (
        Array::from_slice(&cos_basis, &shape),
        Array::from_slice(&sin_basis, &shape),
    )
}

/// Slice a batch of signals into overlapping frames.
///
/// # Arguments
/// * `signal` - `[batch, samples]`
///
/// # Returns
/// Frames `[batch, frames, n_fft]`
pub fn frame_signal(signal: &Array, config: &StftConfig) -> Result<Array> {
    let signal = if config.center {
        pad_signal(signal, config.n_fft / 2, config.pad_mode)?
    } else {
        signal.clone()
    };

    let length = signal.dim(1);
    if length < config.n_fft {
        return Err(AudioError::SignalTooShort {
            len: length,
            required: config.n_fft,
        });
    }

    let num_frames = (length - config.n_fft) / config.hop_length + 1;
    let indices: Vec<i32> = (0..num_frames)
        .flat_map(|f| {
            let start = f * config.hop_length;
            start..start + config.n_fft
        })
        .collect();
    let indices = Array::from_slice(&indices, &[num_frames, config.n_fft]);

    Ok(signal.take_axis(&indices, 1)?)
}

/// Compute the STFT power spectrum.
///
/// # Arguments
/// * `signal` - Input audio `[samples]` or `[batch, samples]`
/// * `config` - STFT configuration
///
/// # Returns
/// Power `|X|^2` as `[batch, n_fft/2+1, frames]`
pub fn stft_power(signal: &Array, config: &StftConfig) -> Result<Array> {
    let signal = if signal.ndim() == 1 {
        signal.reshape(&[1, -1])?
    } else {
        signal.clone()
    };

    let frames = frame_signal(&signal, config)?;
    let (cos_basis, sin_basis) = dft_bases(config);

    let re = frames.matmul(&cos_basis)?;
    let im = frames.matmul(&sin_basis)?;
    let power = re.square()?.add(&im.square()?)?;

    Ok(power.transpose_axes(&[0, 2, 1])?)
}

/// Pad signal for STFT.
fn pad_signal(signal: &Array, pad_amount: i32, mode: PadMode) -> Result<Array> {
    let batch_size = signal.dim(0);
    let length = signal.dim(1);

    match mode {
        PadMode::Zeros => {
            let pad = mlx_rs::ops::zeros::<f32>(&[batch_size, pad_amount])?;
            mlx_rs::ops::concatenate_axis(&[&pad, signal, &pad], 1)
        }
        PadMode::Reflect => {
            if length <= pad_amount {
                return Err(AudioError::SignalTooShort {
                    len: length,
                    required: pad_amount,
                });
            }
            // left: signal[pad_amount:0:-1], right: signal[-2:-pad_amount-2:-1]
            let left: Vec<i32> = (1..=pad_amount).rev().collect();
            let right: Vec<i32> = ((length - pad_amount - 1)..(length - 1)).rev().collect();
            let left_pad = signal.take_axis(&Array::from_slice(&left, &[pad_amount]), 1)?;
            let right_pad = signal.take_axis(&Array::from_slice(&right, &[pad_amount]), 1)?;
            mlx_rs::ops::concatenate_axis(&[&left_pad, signal, &right_pad], 1)
        }
        PadMode::Replicate => {
            use mlx_rs::ops::indexing::IndexOp;
            let left_val = signal.index((.., ..1));
            let right_val = signal.index((.., -1..));

            let left_pad = mlx_rs::ops::broadcast_to(&left_val, &[batch_size, pad_amount])?;
            let right_pad = mlx_rs::ops::broadcast_to(&right_val, &[batch_size, pad_amount])?;

            mlx_rs::ops::concatenate_axis(&[&left_pad, signal, &right_pad], 1)
        }
    }
    .map_err(AudioError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window_is_periodic() {
        let w = hann_window_values(4);
        // periodic hann(4) = [0, 0.5, 1, 0.5]
        assert!(w[0].abs() < 1e-6);
        assert!((w[1] - 0.5).abs() < 1e-6);
        assert!((w[2] - 1.0).abs() < 1e-6);
        assert!((w[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_frame_count() {
        let config = StftConfig::new(16, 4, 16);
        let signal = mlx_rs::ops::ones::<f32>(&[2, 64]).unwrap();
        let frames = frame_signal(&signal, &config).unwrap();
        // centered: 64 + 16 samples -> (80 - 16) / 4 + 1
        assert_eq!(frames.shape(), &[2, 17, 16]);
    }

    #[test]
    fn test_power_of_sinusoid_peaks_at_its_bin() {
        let n_fft = 32;
        let config = StftConfig {
            center: false,
            ..StftConfig::new(n_fft, n_fft, n_fft)
        };
        let bin = 4.0f32;
        let samples: Vec<f32> = (0..n_fft)
            .map(|i| (2.0 * std::f32::consts::PI * bin * i as f32 / n_fft as f32).cos())
            .collect();
        let signal = Array::from_slice(&samples, &[1, n_fft]);

        let power = stft_power(&signal, &config).unwrap();
        assert_eq!(power.shape(), &[1, 17, 1]);
        let values = power.reshape(&[-1]).unwrap();
        values.eval().unwrap();
        let values = values.as_slice::<f32>();
        let peak = values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 4);
    }

    #[test]
    fn test_reflect_rejects_short_signal() {
        let config = StftConfig::new(64, 16, 64);
        let signal = mlx_rs::ops::ones::<f32>(&[1, 20]).unwrap();
        assert!(stft_power(&signal, &config).is_err());
    }
}
