//! Alignment, duration and phoneme-recognition losses.
//!
//! These are computed per utterance over the valid length and averaged over
//! the batch size, so padding never contributes.

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::ops::{logsumexp_axis, maximum, take_along_axis};
use mlx_rs::Array;

use crate::{Result, TrainerError};

/// Weight applied to the alignment consistency term.
pub const MONO_WEIGHT: f32 = 10.0;

/// Duration regression and existence losses of one batch.
#[derive(Debug, Clone)]
pub struct DurationLosses {
    /// L1 between summed sigmoid and target frame counts.
    pub dur: Array,
    /// Binary cross-entropy against the run-length target.
    pub ce: Array,
}

fn scalar(value: f32) -> Array {
    Array::from_f32(value)
}

/// Run-length target `[len, K]`: row `p` is one on its first `d_p` columns.
pub fn run_length_target(durations: &[i32], len: usize, k: usize) -> Array {
    let mut data = vec![0.0f32; len * k];
    for (p, &d) in durations.iter().take(len).enumerate() {
        let ones = (d.max(0) as usize).min(k);
        for slot in &mut data[p * k..p * k + ones] {
            *slot = 1.0;
        }
    }
    Array::from_slice(&data, &[len as i32, k as i32])
}

/// Mean binary cross-entropy with logits.
pub fn bce_with_logits(logits: &Array, target: &Array) -> Result<Array> {
    // max(x, 0) - x * t + ln(1 + exp(-|x|))
    let positive = maximum(logits, &scalar(0.0))?;
    let soft = logits.abs()?.negative()?.exp()?.add(&scalar(1.0))?.log()?;
    let loss = positive.subtract(&logits.multiply(target)?)?.add(&soft)?;
    Ok(loss.mean(None)?)
}

/// Duration losses from logits `[B, L, K]` and the aligned frame counts.
///
/// The L1 term ignores the first and last token of each utterance;
/// utterances with two tokens or fewer only contribute to the
/// cross-entropy term.
pub fn duration_losses(
    logits: &Array,
    durations: &[Vec<i32>],
    text_lengths: &[i32],
) -> Result<DurationLosses> {
    let shape = logits.shape();
    if shape.len() != 3 || shape[0] as usize != text_lengths.len() {
        return Err(TrainerError::contract(
            "predictor",
            format!("expected [B, L, K] duration logits, got {shape:?}"),
        ));
    }
    let k = shape[2] as usize;
    let batch = text_lengths.len();

    let mut dur = scalar(0.0);
    let mut ce = scalar(0.0);
    for b in 0..batch {
        let len = text_lengths[b].clamp(0, shape[1]);
        if len == 0 {
            continue;
        }
        let pred = logits.index((b as i32, ..len, ..));
        let target = run_length_target(&durations[b], len as usize, k);
        ce = ce.add(&bce_with_logits(&pred, &target)?)?;

        if len > 2 {
            let summed = mlx_rs::ops::sigmoid(&pred)?.sum_axis(1, None)?;
            let inner: Vec<f32> = durations[b][1..(len - 1) as usize]
                .iter()
                .map(|&d| d as f32)
                .collect();
            let inner_target = Array::from_slice(&inner, &[len - 2]);
            let term = summed
                .index(1..len - 1)
                .subtract(&inner_target)?
                .abs()?
                .mean(None)?;
            dur = dur.add(&term)?;
        }
    }

    let norm = scalar(batch.max(1) as f32);
    Ok(DurationLosses {
        dur: dur.divide(&norm)?,
        ce: ce.divide(&norm)?,
    })
}

/// Phoneme recognition: cross-entropy of `[B, L, V]` logits against the
/// input tokens over each valid length, averaged over the batch.
pub fn s2s_loss(logits: &Array, texts: &Array, text_lengths: &[i32]) -> Result<Array> {
    let batch = text_lengths.len();
    let mut total = scalar(0.0);
    for b in 0..batch {
        let len = text_lengths[b].clamp(0, logits.dim(1));
        if len == 0 {
            continue;
        }
        let rows = logits.index((b as i32, ..len, ..));
        let targets = texts.index((b as i32, ..len)).reshape(&[len, 1])?;
        let picked = take_along_axis(&rows, &targets, -1)?.reshape(&[len])?;
        let lse = logsumexp_axis(&rows, -1, None)?;
        total = total.add(&lse.subtract(&picked)?.mean(None)?)?;
    }
    Ok(total.divide(&scalar(batch.max(1) as f32))?)
}

/// Alignment consistency `10 · mean|attn - mono|`.
pub fn mono_loss(attn: &Array, mono: &Array) -> Result<Array> {
    Ok(attn
        .subtract(mono)?
        .abs()?
        .mean(None)?
        .multiply(&scalar(MONO_WEIGHT))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(a: &Array) -> f32 {
        a.eval().unwrap();
        a.item::<f32>()
    }

    #[test]
    fn test_run_length_target() {
        let t = run_length_target(&[2, 0, 5], 3, 4);
        t.eval().unwrap();
        assert_eq!(
            t.as_slice::<f32>(),
            &[1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let logits = Array::from_slice(&[0.0f32, 2.0], &[2]);
        let target = Array::from_slice(&[1.0f32, 0.0], &[2]);
        let expected = ((2.0f32).ln() + (1.0 + 2.0f32.exp()).ln()) / 2.0;
        assert!((value(&bce_with_logits(&logits, &target).unwrap()) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_duration_l1_excludes_edges() {
        // large positive logits: sigmoid ~ 1, so summed = K = 3 for every token
        let logits = mlx_rs::ops::full::<f32>(&[1, 4, 3], Array::from_f32(30.0)).unwrap();
        let durations = vec![vec![100, 3, 1, 100]];
        let losses = duration_losses(&logits, &durations, &[4]).unwrap();
        // inner tokens: |3 - 3| and |3 - 1| -> mean 1
        assert!((value(&losses.dur) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_short_utterance_skips_l1() {
        let logits = mlx_rs::ops::zeros::<f32>(&[2, 3, 2]).unwrap();
        let durations = vec![vec![1, 1, 0], vec![1, 1, 1]];
        let losses = duration_losses(&logits, &durations, &[2, 3]).unwrap();
        // only the second utterance has an inner token: |1 - 1| = 0
        assert!(value(&losses.dur).abs() < 1e-6);
        // zero logits: BCE is ln 2 per element for both utterances
        assert!((value(&losses.ce) - 2.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_s2s_uniform_logits() {
        let logits = mlx_rs::ops::zeros::<f32>(&[2, 3, 5]).unwrap();
        let texts = Array::from_slice(&[1i32, 2, 3, 4, 0, 0], &[2, 3]);
        let loss = s2s_loss(&logits, &texts, &[3, 2]).unwrap();
        assert!((value(&loss) - 5.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_mono_loss_weight() {
        let a = mlx_rs::ops::ones::<f32>(&[1, 2, 2]).unwrap();
        let b = mlx_rs::ops::zeros::<f32>(&[1, 2, 2]).unwrap();
        assert!((value(&mono_loss(&a, &b).unwrap()) - 10.0).abs() < 1e-6);
    }
}
