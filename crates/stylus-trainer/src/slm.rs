//! Speech-LM critic.
//!
//! A frozen speech representation model (`slm`) turns waveforms into hidden
//! states; the `wd` unit scores the stacked states frame by frame. The critic
//! provides three objectives:
//!
//! - a feature loss, `Σ_layers mean|h_real - h_fake|`, for the main
//!   generator step;
//! - an LSGAN generator loss on `wd(h_fake)`;
//! - an LSGAN discriminator loss on `wd(h_real)` and `wd(h_fake)` with both
//!   hidden-state sets detached.
//!
//! Waveforms are resampled from the training rate to the SLM rate first.

use mlx_rs::error::Exception;
use mlx_rs::ops::concatenate_axis;
use mlx_rs::Array;
use stylus_audio::audio::resample_linear;

use crate::registry::{names, UnitCaller};
use crate::unit::Entry;

type MlxResult<T> = std::result::Result<T, Exception>;

/// Critic over speech-LM hidden states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechLmCritic {
    sr: u32,
    slm_sr: u32,
}

fn flatten_wave(wave: &Array) -> MlxResult<Array> {
    let b = wave.dim(0);
    wave.reshape(&[b, -1])
}

impl SpeechLmCritic {
    /// Critic for waveforms at `sr`, feeding a model that expects `slm_sr`.
    pub fn new(sr: u32, slm_sr: u32) -> Self {
        Self { sr, slm_sr }
    }

    /// Hidden states of `[B, S]` or `[B, 1, S]` waveforms.
    pub fn hidden_states(&self, caller: &UnitCaller<'_>, wave: &Array) -> MlxResult<Vec<Array>> {
        let flat = flatten_wave(wave)?;
        let resampled = resample_linear(&flat, self.sr, self.slm_sr)?;
        let hidden = caller.call(names::SLM, Entry::Forward, &[&resampled])?;
        if hidden.is_empty() {
            return Err(Exception::custom("slm returned no hidden states"));
        }
        Ok(hidden)
    }

    /// Feature loss; gradients flow only through `fake`.
    pub fn feature_loss(&self, caller: &UnitCaller<'_>, real: &Array, fake: &Array) -> MlxResult<Array> {
        let real_hidden = self.hidden_states(caller, &mlx_rs::stop_gradient(real)?)?;
        let fake_hidden = self.hidden_states(caller, fake)?;
        let mut total = Array::from_f32(0.0);
        for (r, f) in real_hidden.iter().zip(&fake_hidden) {
            let r = mlx_rs::stop_gradient(r)?;
            total = total.add(&r.subtract(f)?.abs()?.mean(None)?)?;
        }
        Ok(total)
    }

    /// Stack `[B, F, D]` states into `[B, layers·D, F]`.
    fn stack(hidden: &[Array]) -> MlxResult<Array> {
        let transposed = hidden
            .iter()
            .map(|h| h.transpose_axes(&[0, 2, 1]))
            .collect::<MlxResult<Vec<_>>>()?;
        concatenate_axis(&transposed, 1)
    }

    fn score(&self, caller: &UnitCaller<'_>, hidden: &[Array]) -> MlxResult<Array> {
        caller.first(names::WD, Entry::Forward, &[&Self::stack(hidden)?])
    }

    /// Generator loss `mean((1 - wd(h_fake))²)`.
    pub fn generator(&self, caller: &UnitCaller<'_>, fake: &Array) -> MlxResult<Array> {
        let hidden = self.hidden_states(caller, fake)?;
        let score = self.score(caller, &hidden)?;
        Array::from_f32(1.0).subtract(&score)?.square()?.mean(None)
    }

    /// Discriminator loss `mean((1 - wd(h_real))²) + mean(wd(h_fake)²)`.
    pub fn discriminator(&self, caller: &UnitCaller<'_>, real: &Array, fake: &Array) -> MlxResult<Array> {
        let real_score = self.discriminator_forward(caller, real)?;
        let fake_score = self.discriminator_forward(caller, fake)?;
        let real_term = Array::from_f32(1.0).subtract(&real_score)?.square()?.mean(None)?;
        let fake_term = fake_score.square()?.mean(None)?;
        real_term.add(&fake_term)
    }

    /// Raw `wd` scores `[B, F]` of detached hidden states.
    pub fn discriminator_forward(&self, caller: &UnitCaller<'_>, wave: &Array) -> MlxResult<Array> {
        let hidden = self
            .hidden_states(caller, &mlx_rs::stop_gradient(wave)?)?
            .iter()
            .map(mlx_rs::stop_gradient)
            .collect::<MlxResult<Vec<_>>>()?;
        self.score(caller, &hidden)
    }
}
