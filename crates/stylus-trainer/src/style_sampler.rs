//! Denoising style sampler.
//!
//! Wraps the `diffusion` unit (the denoiser network) with Karras/EDM
//! preconditioning:
//!
//! ```text
//! c_skip  = σd² / (σ² + σd²)
//! c_out   = σ·σd / √(σ² + σd²)
//! c_in    = 1 / √(σ² + σd²)
//! c_noise = ln(σ) / 4
//! D(x, σ) = c_skip·x + c_out·F(c_in·x, c_noise, embedding, keep, features)
//! ```
//!
//! Sampling uses a Karras noise schedule and the ADPM2 step with ancestral
//! noise. All randomness is drawn up front into [`SamplerDraw`] and
//! [`LossDraw`] so that a loss closure evaluated under autodiff replays the
//! exact same computation.

use mlx_rs::error::Exception;
use mlx_rs::random;
use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::Rng;
use stylus_core::DistParams;

use crate::unit::{first_output, Entry, TrainableUnit, UnitParams};

type MlxResult<T> = std::result::Result<T, Exception>;

/// Karras noise schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KarrasSchedule {
    /// Smallest noise level.
    pub sigma_min: f32,
    /// Largest noise level.
    pub sigma_max: f32,
    /// Curvature.
    pub rho: f32,
}

impl Default for KarrasSchedule {
    fn default() -> Self {
        Self {
            sigma_min: 1e-4,
            sigma_max: 3.0,
            rho: 9.0,
        }
    }
}

impl KarrasSchedule {
    /// `num_steps` decreasing noise levels followed by a trailing zero.
    pub fn sigmas(&self, num_steps: usize) -> Vec<f32> {
        let inv_rho = 1.0 / self.rho;
        let hi = self.sigma_max.powf(inv_rho);
        let lo = self.sigma_min.powf(inv_rho);
        let mut sigmas: Vec<f32> = (0..num_steps)
            .map(|i| {
                let t = if num_steps > 1 {
                    i as f32 / (num_steps - 1) as f32
                } else {
                    0.0
                };
                (hi + t * (lo - hi)).powf(self.rho)
            })
            .collect();
        sigmas.push(0.0);
        sigmas
    }
}

/// ADPM2 noise levels for one step: `(sigma_up, sigma_down, sigma_mid)`.
pub fn adpm2_sigmas(sigma: f32, sigma_next: f32) -> (f32, f32, f32) {
    let sigma_up =
        (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2)).max(0.0).sqrt();
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();
    let sigma_mid = (sigma + sigma_down) / 2.0;
    (sigma_up, sigma_down, sigma_mid)
}

/// Pre-drawn randomness for one sampler call.
#[derive(Debug, Clone)]
pub struct SamplerDraw {
    /// Number of schedule steps.
    pub num_steps: usize,
    /// Initial noise `[B, 1, D]`.
    pub noise: Array,
    /// Ancestral noise per step, `num_steps - 1` arrays `[B, 1, D]`.
    pub step_noise: Vec<Array>,
    /// `1.0` where the text embedding is kept, `0.0` where it is replaced by
    /// the learned fixed embedding.
    pub keep: Array,
}

/// Pre-drawn randomness for one training loss evaluation.
#[derive(Debug, Clone)]
pub struct LossDraw {
    /// Noise level per item `[B]`.
    pub sigmas: Array,
    /// Gaussian noise `[B, 1, D]`.
    pub noise: Array,
    /// Embedding keep mask `[B]`.
    pub keep: Array,
}

fn gaussian(rng: &mut StdRng, shape: &[i32]) -> MlxResult<Array> {
    let key = random::key(rng.gen())?;
    random::normal::<f32>(shape, None, None, &key)
}

/// Unbiased standard deviation along the last axis, averaged over the batch.
///
/// Returns `None` for fewer than two columns.
pub fn estimate_sigma_data(style: &Array) -> MlxResult<Option<f32>> {
    let n = style.dim(-1);
    if n < 2 {
        return Ok(None);
    }
    let mean = style.mean_axis(-1, true)?;
    let var = style
        .subtract(&mean)?
        .square()?
        .sum_axis(-1, None)?
        .divide(&Array::from_f32((n - 1) as f32))?;
    let estimate = var.sqrt()?.mean(None)?;
    estimate.eval()?;
    Ok(Some(estimate.item::<f32>()))
}

/// EDM-preconditioned sampler and loss around a denoiser unit.
#[derive(Debug, Clone)]
pub struct StyleSampler {
    sigma_data: f32,
    dist_mean: f32,
    dist_std: f32,
    schedule: KarrasSchedule,
    embedding_mask_proba: f32,
}

impl StyleSampler {
    /// Sampler from distribution parameters.
    pub fn new(dist: &DistParams, embedding_mask_proba: f32) -> Self {
        Self {
            sigma_data: dist.sigma_data,
            dist_mean: dist.mean,
            dist_std: dist.std,
            schedule: KarrasSchedule::default(),
            embedding_mask_proba,
        }
    }

    /// Override the schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: KarrasSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Current `sigma_data`.
    pub fn sigma_data(&self) -> f32 {
        self.sigma_data
    }

    /// Replace `sigma_data` (batch-wise re-estimation).
    pub fn set_sigma_data(&mut self, sigma_data: f32) {
        self.sigma_data = sigma_data;
    }

    /// Noise schedule.
    pub fn schedule(&self) -> &KarrasSchedule {
        &self.schedule
    }

    fn keep_mask(&self, rng: &mut StdRng, batch: i32, proba: f32) -> Array {
        let keep: Vec<f32> = (0..batch)
            .map(|_| if rng.gen::<f32>() < proba { 0.0 } else { 1.0 })
            .collect();
        Array::from_slice(&keep, &[batch])
    }

    /// Draw everything a sampler call with `num_steps` steps needs.
    pub fn draw_sampler(
        &self,
        rng: &mut StdRng,
        batch: i32,
        dim: i32,
        num_steps: usize,
    ) -> MlxResult<SamplerDraw> {
        let shape = [batch, 1, dim];
        let noise = gaussian(rng, &shape)?;
        let step_noise = (0..num_steps.saturating_sub(1))
            .map(|_| gaussian(rng, &shape))
            .collect::<MlxResult<Vec<_>>>()?;
        let keep = self.keep_mask(rng, batch, self.embedding_mask_proba);
        Ok(SamplerDraw {
            num_steps,
            noise,
            step_noise,
            keep,
        })
    }

    /// Draw a LogNormal noise level and Gaussian noise per item.
    ///
    /// With `conditional` (reference features present) the text embedding of
    /// each item is dropped with `embedding_mask_proba`; otherwise it is
    /// always kept.
    pub fn draw_loss(
        &self,
        rng: &mut StdRng,
        batch: i32,
        dim: i32,
        conditional: bool,
    ) -> MlxResult<LossDraw> {
        let normal = gaussian(rng, &[batch])?;
        let sigmas = normal
            .multiply(&Array::from_f32(self.dist_std))?
            .add(&Array::from_f32(self.dist_mean))?
            .exp()?;
        let noise = gaussian(rng, &[batch, 1, dim])?;
        let keep = if conditional {
            self.keep_mask(rng, batch, self.embedding_mask_proba)
        } else {
            mlx_rs::ops::ones::<f32>(&[batch])?
        };
        Ok(LossDraw { sigmas, noise, keep })
    }

    /// Preconditioned denoiser `D(x, σ)` with per-item `sigma` of shape `[B]`.
    #[allow(clippy::too_many_arguments)]
    pub fn denoise(
        &self,
        net: &dyn TrainableUnit,
        params: &UnitParams,
        x: &Array,
        sigma: &Array,
        embedding: &Array,
        keep: &Array,
        features: Option<&Array>,
    ) -> MlxResult<Array> {
        let sd2 = Array::from_f32(self.sigma_data * self.sigma_data);
        let sd = Array::from_f32(self.sigma_data);
        let s = sigma.reshape(&[-1, 1, 1])?;
        let s2 = s.square()?;
        let total = s2.add(&sd2)?;

        let c_skip = sd2.divide(&total)?;
        let c_out = s.multiply(&sd)?.divide(&total.sqrt()?)?;
        let c_in = Array::from_f32(1.0).divide(&total.sqrt()?)?;
        let c_noise = sigma.log()?.multiply(&Array::from_f32(0.25))?;

        let scaled = x.multiply(&c_in)?;
        let mut inputs: Vec<&Array> = vec![&scaled, &c_noise, embedding, keep];
        if let Some(f) = features {
            inputs.push(f);
        }
        let out = first_output(net.forward(Entry::Forward, params, &inputs)?, "diffusion")?;
        c_skip.multiply(x)?.add(&c_out.multiply(&out)?)
    }

    /// Weighted denoising loss of clean styles `x` `[B, 1, D]`.
    pub fn loss(
        &self,
        net: &dyn TrainableUnit,
        params: &UnitParams,
        x: &Array,
        embedding: &Array,
        features: Option<&Array>,
        draw: &LossDraw,
    ) -> MlxResult<Array> {
        let s = draw.sigmas.reshape(&[-1, 1, 1])?;
        let noisy = x.add(&draw.noise.multiply(&s)?)?;
        let denoised = self.denoise(net, params, &noisy, &draw.sigmas, embedding, &draw.keep, features)?;

        let per_item = denoised
            .subtract(x)?
            .square()?
            .reshape(&[x.dim(0), -1])?
            .mean_axis(-1, None)?;

        let sd2 = self.sigma_data * self.sigma_data;
        let s2 = draw.sigmas.square()?;
        let weight = s2
            .add(&Array::from_f32(sd2))?
            .divide(&s2.multiply(&Array::from_f32(sd2))?)?;
        per_item.multiply(&weight)?.mean(None)
    }

    /// Run ADPM2 from pure noise; returns `[B, 1, D]`.
    pub fn sample(
        &self,
        net: &dyn TrainableUnit,
        params: &UnitParams,
        embedding: &Array,
        features: Option<&Array>,
        draw: &SamplerDraw,
    ) -> MlxResult<Array> {
        let sigmas = self.schedule.sigmas(draw.num_steps);
        let batch = draw.noise.dim(0);
        let level = |value: f32| -> MlxResult<Array> {
            mlx_rs::ops::full::<f32>(&[batch], Array::from_f32(value))
        };

        let mut x = draw.noise.multiply(&Array::from_f32(sigmas[0]))?;
        for i in 0..draw.num_steps.saturating_sub(1) {
            let (sigma, sigma_next) = (sigmas[i], sigmas[i + 1]);
            let (sigma_up, sigma_down, sigma_mid) = adpm2_sigmas(sigma, sigma_next);

            let denoised =
                self.denoise(net, params, &x, &level(sigma)?, embedding, &draw.keep, features)?;
            let d = x.subtract(&denoised)?.divide(&Array::from_f32(sigma))?;
            let x_mid = x.add(&d.multiply(&Array::from_f32(sigma_mid - sigma))?)?;

            let denoised_mid = self.denoise(
                net,
                params,
                &x_mid,
                &level(sigma_mid)?,
                embedding,
                &draw.keep,
                features,
            )?;
            let d_mid = x_mid
                .subtract(&denoised_mid)?
                .divide(&Array::from_f32(sigma_mid))?;
            x = x.add(&d_mid.multiply(&Array::from_f32(sigma_down - sigma))?)?;
            x = x.add(&draw.step_noise[i].multiply(&Array::from_f32(sigma_up))?)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceModelBuilder;
    use crate::registry::names;
    use rand::SeedableRng;

    fn sampler() -> StyleSampler {
        StyleSampler::new(&DistParams::default(), 0.1)
    }

    #[test]
    fn test_karras_schedule() {
        let sigmas = KarrasSchedule::default().sigmas(4);
        assert_eq!(sigmas.len(), 5);
        assert!((sigmas[0] - 3.0).abs() < 1e-4);
        assert!((sigmas[3] - 1e-4).abs() < 1e-6);
        assert_eq!(sigmas[4], 0.0);
        assert!(sigmas.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_adpm2_sigmas_to_zero() {
        let (up, down, mid) = adpm2_sigmas(1.0, 0.0);
        assert_eq!(up, 0.0);
        assert_eq!(down, 0.0);
        assert!((mid - 0.5).abs() < 1e-6);

        let (up, down, _) = adpm2_sigmas(2.0, 1.0);
        assert!((up * up + down * down - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sigma_estimate() {
        let style = Array::from_slice(&[1.0f32, 3.0, 0.0, 0.0], &[2, 2]);
        let estimate = estimate_sigma_data(&style).unwrap().unwrap();
        // std of [1, 3] is sqrt(2), of [0, 0] is 0
        assert!((estimate - 2.0f32.sqrt() / 2.0).abs() < 1e-5);
        let single = Array::from_slice(&[1.0f32], &[1, 1]);
        assert!(estimate_sigma_data(&single).unwrap().is_none());
    }

    #[test]
    fn test_draws_are_reproducible() {
        let s = sampler();
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let da = s.draw_sampler(&mut a, 2, 8, 4).unwrap();
        let db = s.draw_sampler(&mut b, 2, 8, 4).unwrap();
        assert_eq!(da.step_noise.len(), 3);
        let diff = da.noise.subtract(&db.noise).unwrap().abs().unwrap().sum(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);
    }

    #[test]
    fn test_sample_and_loss_shapes() {
        let registry = ReferenceModelBuilder::tiny().build(0);
        let net = registry.get(names::DIFFUSION).unwrap();
        let dim = 2 * ReferenceModelBuilder::tiny().style_dim;
        let s = sampler();
        let mut rng = StdRng::seed_from_u64(1);
        let embedding = mlx_rs::ops::ones::<f32>(&[2, 3, ReferenceModelBuilder::tiny().bert_dim]).unwrap();

        let draw = s.draw_sampler(&mut rng, 2, dim, 3).unwrap();
        let out = s.sample(net, net.parameters(), &embedding, None, &draw).unwrap();
        assert_eq!(out.shape(), &[2, 1, dim]);

        let x = mlx_rs::ops::zeros::<f32>(&[2, 1, dim]).unwrap();
        let loss_draw = s.draw_loss(&mut rng, 2, dim, false).unwrap();
        let loss = s.loss(net, net.parameters(), &x, &embedding, None, &loss_draw).unwrap();
        loss.eval().unwrap();
        assert!(loss.item::<f32>().is_finite());
        assert!(loss.item::<f32>() >= 0.0);
    }

    #[test]
    fn test_conditional_loss_draw_masks_embeddings() {
        let s = StyleSampler::new(&DistParams::default(), 0.5);
        let mut rng = StdRng::seed_from_u64(21);

        let draw = s.draw_loss(&mut rng, 64, 8, true).unwrap();
        draw.keep.eval().unwrap();
        let keep = draw.keep.as_slice::<f32>();
        assert_eq!(keep.len(), 64);
        assert!(keep.iter().all(|&k| k == 0.0 || k == 1.0));
        assert!(keep.iter().any(|&k| k == 0.0));
        assert!(keep.iter().any(|&k| k == 1.0));

        let plain = s.draw_loss(&mut rng, 64, 8, false).unwrap();
        plain.keep.eval().unwrap();
        assert!(plain.keep.as_slice::<f32>().iter().all(|&k| k == 1.0));

        // same seed, same mask
        let mut again = StdRng::seed_from_u64(21);
        let replay = s.draw_loss(&mut again, 64, 8, true).unwrap();
        replay.keep.eval().unwrap();
        assert_eq!(replay.keep.as_slice::<f32>(), keep);
    }
}
