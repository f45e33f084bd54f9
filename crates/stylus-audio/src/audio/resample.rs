//! Linear-interpolation resampling.

use mlx_rs::Array;

use crate::error::{AudioError, Result};

/// Resample `[batch, samples]` (or `[samples]`) from `from_sr` to `to_sr`.
///
/// Output sample `i` interpolates the input at `i * from_sr / to_sr`.
/// Gathers and weights are built on the host; the interpolation itself is
/// differentiable with respect to `signal`.
pub fn resample_linear(signal: &Array, from_sr: u32, to_sr: u32) -> Result<Array> {
    if from_sr == 0 || to_sr == 0 {
        return Err(AudioError::Config(format!(
            "invalid sample rates {from_sr} -> {to_sr}"
        )));
    }
    if from_sr == to_sr {
        return Ok(signal.clone());
    }

    let axis = signal.ndim() as i32 - 1;
    let length = signal.dim(axis);
    if length < 1 {
        return Err(AudioError::SignalTooShort { len: length, required: 1 });
    }

    let n_out = ((length as u64 * to_sr as u64) / from_sr as u64).max(1) as usize;
    let ratio = from_sr as f64 / to_sr as f64;

    let mut lower = Vec::with_capacity(n_out);
    let mut upper = Vec::with_capacity(n_out);
    let mut frac = Vec::with_capacity(n_out);
    for i in 0..n_out {
        let pos = i as f64 * ratio;
        let i0 = (pos.floor() as i32).min(length - 1);
        lower.push(i0);
        upper.push((i0 + 1).min(length - 1));
        frac.push((pos - i0 as f64).clamp(0.0, 1.0) as f32);
    }

    let shape = [n_out as i32];
    let lo = signal.take_axis(&Array::from_slice(&lower, &shape), axis)?;
    let hi = signal.take_axis(&Array::from_slice(&upper, &shape), axis)?;
    let w = Array::from_slice(&frac, &shape);

    Ok(lo.add(&hi.subtract(&lo)?.multiply(&w)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rate() {
        let x = Array::from_slice(&[1.0f32, 2.0, 3.0], &[1, 3]);
        let y = resample_linear(&x, 16000, 16000).unwrap();
        assert_eq!(y.shape(), &[1, 3]);
    }

    #[test]
    fn test_downsample_ramp() {
        // ramp sampled at 24k, resampled to 16k stays a ramp with slope 1.5
        let samples: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let x = Array::from_slice(&samples, &[1, 12]);
        let y = resample_linear(&x, 24000, 16000).unwrap();
        y.eval().unwrap();
        assert_eq!(y.shape(), &[1, 8]);
        for (i, &v) in y.as_slice::<f32>().iter().enumerate() {
            assert!((v - 1.5 * i as f32).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_zero_rate() {
        let x = Array::from_slice(&[1.0f32], &[1]);
        assert!(resample_linear(&x, 0, 16000).is_err());
    }
}
