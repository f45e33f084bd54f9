//! Adversarial and reconstruction losses for waveform generators.
//!
//! All losses return scalar arrays and stay inside the MLX graph so that
//! they can be differentiated by `keyed_value_and_grad`.
//!
//! - [`generator_loss`]: LSGAN + feature matching + relativistic term
//! - [`discriminator_loss`]: LSGAN + relativistic term
//! - [`MultiResolutionStftLoss`]: spectral convergence over log-mel spectra

mod stft_loss;

pub use stft_loss::{MultiResolutionStftLoss, StftResolution, DEFAULT_RESOLUTIONS};

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::ops::{argsort_axis, maximum, minimum};
use mlx_rs::Array;

use crate::error::{AudioError, Result};

/// Truncation threshold of the relativistic loss.
pub const TPRLS_TAU: f32 = 0.04;

/// Weight applied to the feature matching sum.
pub const FEATURE_MATCHING_WEIGHT: f32 = 2.0;

/// Outputs of a multi-head discriminator.
///
/// Units return a flat list `[logits_0, .., logits_{k-1}, features..]`;
/// this splits it back into heads and intermediate feature maps.
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    /// One score map per head.
    pub logits: Vec<Array>,
    /// Intermediate activations used for feature matching.
    pub features: Vec<Array>,
}

impl DiscriminatorOutput {
    /// Split a flat output list after `num_heads` logits.
    pub fn from_flat(mut outputs: Vec<Array>, num_heads: usize) -> Result<Self> {
        if num_heads == 0 || outputs.len() < num_heads {
            return Err(AudioError::Config(format!(
                "discriminator returned {} outputs, expected at least {num_heads} heads",
                outputs.len()
            )));
        }
        let features = outputs.split_off(num_heads);
        Ok(Self {
            logits: outputs,
            features,
        })
    }
}

/// Components of the generator adversarial objective.
#[derive(Debug, Clone)]
pub struct GeneratorLossOutput {
    /// Total loss.
    pub total: Array,
    /// LSGAN term `Σ mean((1 - D(fake))²)`.
    pub adversarial: Array,
    /// Weighted feature matching term.
    pub feature_matching: Array,
    /// Relativistic term.
    pub relativistic: Array,
}

/// Components of the discriminator objective.
#[derive(Debug, Clone)]
pub struct DiscriminatorLossOutput {
    /// Total loss.
    pub total: Array,
    /// LSGAN term.
    pub adversarial: Array,
    /// Relativistic term.
    pub relativistic: Array,
}

fn scalar(value: f32) -> Array {
    Array::from_f32(value)
}

fn check_pairs(real: &[Array], fake: &[Array], what: &str) -> Result<()> {
    if real.len() != fake.len() {
        return Err(AudioError::Config(format!(
            "{what}: {} real vs {} generated tensors",
            real.len(),
            fake.len()
        )));
    }
    Ok(())
}

/// Mean absolute error.
pub fn l1_loss(prediction: &Array, target: &Array) -> Result<Array> {
    Ok(prediction.subtract(target)?.abs()?.mean(None)?)
}

/// Mean squared error.
pub fn mse_loss(prediction: &Array, target: &Array) -> Result<Array> {
    Ok(prediction.subtract(target)?.square()?.mean(None)?)
}

/// Smooth L1 (Huber, beta = 1) averaged over all elements.
pub fn smooth_l1_loss(prediction: &Array, target: &Array) -> Result<Array> {
    let diff = prediction.subtract(target)?.abs()?;
    let quadratic = diff.square()?.multiply(&scalar(0.5))?;
    let linear = diff.subtract(&scalar(0.5))?;
    let loss = mlx_rs::ops::r#where(&diff.lt(&scalar(1.0))?, &quadratic, &linear)?;
    Ok(loss.mean(None)?)
}

/// Generator LSGAN term: `Σ_k mean((1 - fake_k)²)`.
pub fn generator_adversarial_loss(fake: &[Array]) -> Result<Array> {
    let mut total = scalar(0.0);
    for logits in fake {
        let term = scalar(1.0).subtract(logits)?.square()?.mean(None)?;
        total = total.add(&term)?;
    }
    Ok(total)
}

/// Discriminator LSGAN term: `Σ_k mean((1 - real_k)²) + mean(fake_k²)`.
pub fn discriminator_adversarial_loss(real: &[Array], fake: &[Array]) -> Result<Array> {
    check_pairs(real, fake, "discriminator loss")?;
    let mut total = scalar(0.0);
    for (r, f) in real.iter().zip(fake) {
        let real_term = scalar(1.0).subtract(r)?.square()?.mean(None)?;
        let fake_term = f.square()?.mean(None)?;
        total = total.add(&real_term)?.add(&fake_term)?;
    }
    Ok(total)
}

/// Feature matching: `2 · Σ mean|real - fake|` over paired feature maps.
pub fn feature_matching_loss(real: &[Array], fake: &[Array]) -> Result<Array> {
    check_pairs(real, fake, "feature matching")?;
    let mut total = scalar(0.0);
    for (r, f) in real.iter().zip(fake) {
        total = total.add(&l1_loss(r, f)?)?;
    }
    Ok(total.multiply(&scalar(FEATURE_MATCHING_WEIGHT))?)
}

/// Lower median of all elements, outside the gradient graph.
fn lower_median(values: &Array) -> Result<Array> {
    let flat = mlx_rs::stop_gradient(values)?.reshape(&[-1])?;
    let n = flat.dim(0);
    if n == 0 {
        return Err(AudioError::SignalTooShort { len: 0, required: 1 });
    }
    let order = argsort_axis(&flat, 0)?;
    let sorted = flat.take_axis(&order, 0)?;
    Ok(sorted.index((n - 1) / 2))
}

/// Truncated pointwise relativistic least-squares term for one head.
///
/// With `d = a - b` and `m = median(d)`, the term is the mean of `(d - m)²`
/// over positions where `d < m`, clipped at [`TPRLS_TAU`]. An empty selection
/// contributes zero.
pub fn relativistic_term(a: &Array, b: &Array) -> Result<Array> {
    let diff = a.subtract(b)?;
    let median = lower_median(&diff)?;
    let mask = diff.lt(&median)?.as_dtype(mlx_rs::Dtype::Float32)?;
    let centered = diff.subtract(&median)?.square()?;
    let count = maximum(&mask.sum(None)?, &scalar(1.0))?;
    let masked_mean = centered.multiply(&mask)?.sum(None)?.divide(&count)?;
    Ok(minimum(&masked_mean, &scalar(TPRLS_TAU))?)
}

/// Relativistic loss summed over heads, `Σ_k term(a_k, b_k)`.
///
/// The generator passes `(fake, real)` and the discriminator `(real, fake)`.
pub fn relativistic_loss(a: &[Array], b: &[Array]) -> Result<Array> {
    check_pairs(a, b, "relativistic loss")?;
    let mut total = scalar(0.0);
    for (x, y) in a.iter().zip(b) {
        total = total.add(&relativistic_term(x, y)?)?;
    }
    Ok(total)
}

/// Full generator objective against one discriminator.
pub fn generator_loss(
    real: &DiscriminatorOutput,
    fake: &DiscriminatorOutput,
) -> Result<GeneratorLossOutput> {
    let adversarial = generator_adversarial_loss(&fake.logits)?;
    let feature_matching = feature_matching_loss(&real.features, &fake.features)?;
    let relativistic = relativistic_loss(&fake.logits, &real.logits)?;
    let total = adversarial.add(&feature_matching)?.add(&relativistic)?;
    Ok(GeneratorLossOutput {
        total,
        adversarial,
        feature_matching,
        relativistic,
    })
}

/// Full discriminator objective for one discriminator.
pub fn discriminator_loss(
    real: &DiscriminatorOutput,
    fake: &DiscriminatorOutput,
) -> Result<DiscriminatorLossOutput> {
    let adversarial = discriminator_adversarial_loss(&real.logits, &fake.logits)?;
    let relativistic = relativistic_loss(&real.logits, &fake.logits)?;
    let total = adversarial.add(&relativistic)?;
    Ok(DiscriminatorLossOutput {
        total,
        adversarial,
        relativistic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(a: &Array) -> f32 {
        a.eval().unwrap();
        a.item::<f32>()
    }

    #[test]
    fn test_from_flat_splits_heads() {
        let outputs = vec![
            Array::from_f32(1.0),
            Array::from_f32(2.0),
            Array::from_f32(3.0),
        ];
        let out = DiscriminatorOutput::from_flat(outputs, 2).unwrap();
        assert_eq!(out.logits.len(), 2);
        assert_eq!(out.features.len(), 1);

        assert!(DiscriminatorOutput::from_flat(vec![Array::from_f32(1.0)], 2).is_err());
    }

    #[test]
    fn test_lsgan_terms() {
        let ones = vec![mlx_rs::ops::ones::<f32>(&[4]).unwrap()];
        let zeros = vec![mlx_rs::ops::zeros::<f32>(&[4]).unwrap()];
        // perfect generator
        assert!(value(&generator_adversarial_loss(&ones).unwrap()).abs() < 1e-6);
        // perfect discriminator
        assert!(value(&discriminator_adversarial_loss(&ones, &zeros).unwrap()).abs() < 1e-6);
        // fooled discriminator
        let fooled = discriminator_adversarial_loss(&zeros, &ones).unwrap();
        assert!((value(&fooled) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_feature_matching_is_doubled_l1() {
        let real = vec![Array::from_slice(&[1.0f32, 2.0], &[2])];
        let fake = vec![Array::from_slice(&[0.0f32, 2.0], &[2])];
        let loss = feature_matching_loss(&real, &fake).unwrap();
        // mean |diff| = 0.5, times two
        assert!((value(&loss) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_relativistic_term_is_truncated() {
        let a = Array::from_slice(&[-10.0f32, 0.0, 10.0], &[3]);
        let b = mlx_rs::ops::zeros::<f32>(&[3]).unwrap();
        // median 0, only -10 falls below: (−10)² = 100, clipped to tau
        let term = relativistic_term(&a, &b).unwrap();
        assert!((value(&term) - TPRLS_TAU).abs() < 1e-6);
    }

    #[test]
    fn test_relativistic_term_small_spread() {
        let a = Array::from_slice(&[0.0f32, 0.1, 0.2], &[3]);
        let b = mlx_rs::ops::zeros::<f32>(&[3]).unwrap();
        // median 0.1, selection {0.0}: (0.0 - 0.1)² = 0.01
        let term = relativistic_term(&a, &b).unwrap();
        assert!((value(&term) - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_relativistic_term_empty_selection_is_zero() {
        let a = mlx_rs::ops::ones::<f32>(&[5]).unwrap();
        let b = mlx_rs::ops::zeros::<f32>(&[5]).unwrap();
        let term = relativistic_term(&a, &b).unwrap();
        assert!(value(&term).abs() < 1e-6);
    }

    #[test]
    fn test_smooth_l1_branches() {
        let p = Array::from_slice(&[0.5f32, 3.0], &[2]);
        let t = mlx_rs::ops::zeros::<f32>(&[2]).unwrap();
        // 0.5 * 0.25 = 0.125 and 3 - 0.5 = 2.5
        let loss = smooth_l1_loss(&p, &t).unwrap();
        assert!((value(&loss) - (0.125 + 2.5) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_generator_loss_totals_components() {
        let real = DiscriminatorOutput {
            logits: vec![mlx_rs::ops::ones::<f32>(&[3]).unwrap()],
            features: vec![mlx_rs::ops::ones::<f32>(&[2, 2]).unwrap()],
        };
        let fake = DiscriminatorOutput {
            logits: vec![mlx_rs::ops::zeros::<f32>(&[3]).unwrap()],
            features: vec![mlx_rs::ops::zeros::<f32>(&[2, 2]).unwrap()],
        };
        let out = generator_loss(&real, &fake).unwrap();
        let parts = value(&out.adversarial) + value(&out.feature_matching) + value(&out.relativistic);
        assert!((value(&out.total) - parts).abs() < 1e-5);
        assert!((value(&out.adversarial) - 1.0).abs() < 1e-6);
        assert!((value(&out.feature_matching) - 2.0).abs() < 1e-6);
    }
}
