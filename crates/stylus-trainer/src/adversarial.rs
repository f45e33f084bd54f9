//! Speech-LM adversarial stage.
//!
//! Once the joint epoch is reached, every training step ends with an extra
//! round against the speech-LM critic. Styles are either the ground truth
//! or sampled from the denoiser, durations are predicted from text, and a
//! differentiable Gaussian upsampling of the duration logits turns them into
//! a soft alignment. Short random clips of the resulting waveforms are scored
//! by the critic.
//!
//! The generator loss is backpropagated alone, the gradients are reshaped
//! (global rescale driven by the predictor norm, then a fixed amplification
//! of the duration head, the duration encoder and the denoiser) and only
//! `bert_encoder`, `bert`, `predictor` and `diffusion` are stepped. Every
//! `iter` steps the critic itself is updated with two regularisers: one for
//! clip-length invariance and one that ignores reconstruction artifacts.
//!
//! All host decisions (frame counts, clip offsets, coin flips, sampler
//! noise) are taken in [`AdversarialStage::plan`] so that the loss closures
//! replay exactly the same computation under differentiation.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::error::Exception;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::ops::{concatenate_axis, sigmoid, softmax_axis, stack_axis, zeros};
use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::Rng;
use stylus_audio::loss::l1_loss;
use stylus_core::SlmAdvParams;
use tracing::debug;

use crate::alignment::{length_to_mask, valid_mask};
use crate::forward::{crop_wave, differentiate, mel_clip_len};
use crate::multi_optimizer::MultiOptimizer;
use crate::registry::{names, ModelRegistry, UnitCaller};
use crate::slm::SpeechLmCritic;
use crate::style_sampler::{SamplerDraw, StyleSampler};
use crate::unit::Entry;
use crate::Result;

type MlxResult<T> = std::result::Result<T, Exception>;

/// Units stepped after the adversarial generator loss.
pub const GENERATOR_UNITS: [&str; 4] = [
    names::BERT_ENCODER,
    names::BERT,
    names::PREDICTOR,
    names::DIFFUSION,
];

/// Parameter prefixes amplified by `scale` after the global rescale.
pub const AMPLIFIED_PREFIXES: [&str; 3] = [
    "predictor.duration_proj.",
    "predictor.lstm.",
    "diffusion.",
];

/// Inputs handed over by the main training step.
#[derive(Debug, Clone, Copy)]
pub struct AdversarialInputs<'a> {
    /// Index of the batch within the epoch.
    pub step: usize,
    /// Ground-truth waveform clips of the main step `[B, 1, S]`.
    pub y_rec_gt: &'a Array,
    /// Decoder output on ground-truth pitch and energy `[B, 1, S]`.
    pub y_rec_gt_pred: &'a Array,
    /// Raw waveforms.
    pub waves: &'a [Vec<f32>],
    /// Mel frames per utterance.
    pub mel_lengths: &'a [i32],
    /// Text to synthesize `[B, L]`.
    pub ref_texts: &'a Array,
    /// Valid tokens of `ref_texts`.
    pub ref_lengths: &'a [i32],
    /// Whether `ref_texts` is the batch's own text.
    pub use_ind: bool,
    /// Ground-truth style vectors `[B, 2S]`, detached.
    pub s_trg: &'a Array,
    /// Reference styles for multi-speaker sampling `[B, 2S]`.
    pub ref_style: Option<&'a Array>,
}

/// Where the synthesized styles come from.
#[derive(Debug, Clone)]
enum StyleSource {
    Target(Array),
    Sampled(SamplerDraw),
}

/// One kept clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Clip {
    index: usize,
    pred_offset: i32,
}

/// Coin flips of one critic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticPlan {
    /// Use the decoder reconstruction as the real sample.
    pub use_rec: bool,
    /// Score the cropped variant instead of the full-length one.
    pub use_crop: bool,
}

/// Host-side decisions of one adversarial step.
#[derive(Debug, Clone)]
pub struct AdversarialPlan {
    texts: Array,
    lengths: Vec<i32>,
    lengths_array: Array,
    text_mask: Array,
    attention_mask: Array,
    t_en: Array,
    style: StyleSource,
    frames: Vec<i32>,
    mel_len: i32,
    clips: Vec<Clip>,
    wav: Array,
    critic: Option<CriticPlan>,
}

impl AdversarialPlan {
    /// Predicted frame count per utterance.
    pub fn frames(&self) -> &[i32] {
        &self.frames
    }

    /// Clip length in aligner frames.
    pub fn mel_len(&self) -> i32 {
        self.mel_len
    }

    /// Indices of the utterances that were kept.
    pub fn kept(&self) -> Vec<usize> {
        self.clips.iter().map(|c| c.index).collect()
    }

    /// Whether the styles are sampled from the denoiser.
    pub fn samples_styles(&self) -> bool {
        matches!(self.style, StyleSource::Sampled(_))
    }

    /// Critic coins, when the critic is updated this step.
    pub fn critic(&self) -> Option<CriticPlan> {
        self.critic
    }
}

/// Result of an applied adversarial step.
#[derive(Debug, Clone)]
pub struct AdversarialOutcome {
    /// Critic loss (zero when the critic was not updated).
    pub d_loss: f32,
    /// Adversarial generator loss.
    pub gen_loss: f32,
    /// Synthesized clips `[n, 1, S]`.
    pub y_pred: Array,
    /// Gradient surgery applied before stepping.
    pub surgery: SurgeryReport,
}

/// What [`GradientSurgery::apply`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct SurgeryReport {
    /// Predictor gradient norm before any scaling.
    pub predictor_norm: f32,
    /// Whether every gradient was rescaled by `thresh / predictor_norm`.
    pub rescaled: bool,
    /// Number of gradient tensors amplified by `scale`.
    pub amplified: usize,
}

/// Predictor-norm driven rescale followed by targeted amplification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientSurgery {
    /// Predictor norm above which every gradient is rescaled.
    pub thresh: f32,
    /// Factor for the duration head, duration encoder and denoiser.
    pub scale: f32,
}

impl GradientSurgery {
    /// Surgery from the stage parameters.
    pub fn from_params(params: &SlmAdvParams) -> Self {
        Self {
            thresh: params.thresh,
            scale: params.scale,
        }
    }

    /// Reshape the optimizer's accumulated gradients in place.
    pub fn apply(&self, optimizer: &mut MultiOptimizer) -> Result<SurgeryReport> {
        let predictor_norm = optimizer.unit_grad_norm(names::PREDICTOR)?;
        let rescaled = predictor_norm > self.thresh;
        if rescaled {
            optimizer.scale_all(self.thresh / predictor_norm)?;
        }
        let mut amplified = 0;
        for prefix in AMPLIFIED_PREFIXES {
            amplified += optimizer.scale_matching(prefix, self.scale)?;
        }
        Ok(SurgeryReport {
            predictor_norm,
            rescaled,
            amplified,
        })
    }
}

/// Soft alignment `[L_max, l_max]` of one utterance from its duration logits.
///
/// `logits` is `[len, K]`. Token `j` is centered at
/// `loc_j = cumsum(dur)_j - dur_j / 2` with `dur = Σ_k sigmoid(logits)`, and
/// frame `τ` receives `Σ_{i ≤ τ} logits[j, i] · exp(-(loc_j + i - τ - 1)² / 2σ²)`
/// before a softmax over tokens.
pub fn gaussian_upsample(
    logits: &Array,
    frames: i32,
    sig: f32,
    max_tokens: i32,
    max_frames: i32,
) -> MlxResult<Array> {
    let (len, k) = (logits.dim(0), logits.dim(1));
    if frames <= 0 || len == 0 {
        return zeros::<f32>(&[max_tokens, max_frames]);
    }

    let dur = sigmoid(logits)?.sum_axis(-1, None)?;
    let loc = mlx_rs::ops::cumsum(&dur, 0, None, None)?
        .subtract(&dur.multiply(&Array::from_f32(0.5))?)?
        .reshape(&[len, 1, 1])?;

    let mut offsets = Vec::with_capacity((k * frames) as usize);
    let mut causal = Vec::with_capacity((k * frames) as usize);
    for i in 0..k {
        for tau in 0..frames {
            offsets.push((i - tau - 1) as f32);
            causal.push(if i <= tau { 1.0f32 } else { 0.0 });
        }
    }
    let offsets = Array::from_slice(&offsets, &[1, k, frames]);
    let causal = Array::from_slice(&causal, &[1, k, frames]);

    let arg = loc.add(&offsets)?;
    let kernel = arg
        .square()?
        .multiply(&Array::from_f32(-0.5 / (sig * sig)))?
        .exp()?
        .multiply(&causal)?;
    let out = logits
        .reshape(&[len, 1, k])?
        .matmul(&kernel)?
        .reshape(&[len, frames])?;
    let mut attn = softmax_axis(&out, 0, None)?;

    if max_frames > frames {
        let pad = zeros::<f32>(&[len, max_frames - frames])?;
        attn = concatenate_axis(&[attn, pad], 1)?;
    }
    if max_tokens > len {
        let pad = zeros::<f32>(&[max_tokens - len, max_frames])?;
        attn = concatenate_axis(&[attn, pad], 0)?;
    }
    Ok(attn)
}

/// Speech-LM adversarial stage.
#[derive(Debug, Clone)]
pub struct AdversarialStage {
    params: SlmAdvParams,
    critic: SpeechLmCritic,
    hop: i32,
    style_dim: i32,
}

impl AdversarialStage {
    /// Stage with the given parameters, critic, hop length and style half width.
    pub fn new(params: SlmAdvParams, critic: SpeechLmCritic, hop: i32, style_dim: i32) -> Self {
        Self {
            params,
            critic,
            hop,
            style_dim,
        }
    }

    /// Stage parameters.
    pub fn params(&self) -> &SlmAdvParams {
        &self.params
    }

    /// The gradient surgery this stage applies.
    pub fn surgery(&self) -> GradientSurgery {
        GradientSurgery::from_params(&self.params)
    }

    /// Styles `[B, 2S]` for the plan.
    fn styles(
        &self,
        caller: &UnitCaller<'_>,
        sampler: &StyleSampler,
        style: &StyleSource,
        bert_dur: &Array,
        ref_style: Option<&Array>,
    ) -> MlxResult<Array> {
        match style {
            StyleSource::Target(s) => Ok(s.clone()),
            StyleSource::Sampled(draw) => {
                let net = caller.unit(names::DIFFUSION)?;
                let out = sampler.sample(
                    net,
                    caller.params(names::DIFFUSION)?,
                    bert_dur,
                    ref_style,
                    draw,
                )?;
                out.reshape(&[out.dim(0), -1])
            }
        }
    }

    fn encode_text(&self, caller: &UnitCaller<'_>, plan_texts: &Array, attention: &Array) -> MlxResult<(Array, Array)> {
        let bert_dur = caller.first(names::BERT, Entry::Forward, &[plan_texts, attention])?;
        let d_en = caller
            .first(names::BERT_ENCODER, Entry::Forward, &[&bert_dur])?
            .transpose_axes(&[0, 2, 1])?;
        Ok((bert_dur, d_en))
    }

    /// Take every host decision of one step, or `None` when the stage is
    /// skipped (probability gate, too few usable utterances).
    pub fn plan(
        &self,
        registry: &ModelRegistry,
        sampler: &StyleSampler,
        inputs: &AdversarialInputs<'_>,
        rng: &mut StdRng,
    ) -> Result<Option<AdversarialPlan>> {
        if self.params.skip_probability > 0.0 && rng.gen::<f32>() < self.params.skip_probability {
            debug!("adversarial stage skipped by probability gate");
            return Ok(None);
        }

        let batch = inputs.ref_lengths.len();
        let max_tokens = inputs.ref_texts.dim(1);
        let lengths = inputs.ref_lengths.to_vec();
        let lengths_array = Array::from_slice(&lengths, &[batch as i32]);
        let text_mask = length_to_mask(&lengths, max_tokens);
        let attention_mask = valid_mask(&lengths, max_tokens);

        let caller = UnitCaller::new(registry);
        let (bert_dur, d_en) = self.encode_text(&caller, inputs.ref_texts, &attention_mask)?;

        let style = if inputs.use_ind && rng.gen::<f32>() < 0.5 {
            StyleSource::Target(mlx_rs::stop_gradient(inputs.s_trg)?)
        } else {
            let steps = rng.gen_range(3..5);
            StyleSource::Sampled(sampler.draw_sampler(
                rng,
                batch as i32,
                inputs.s_trg.dim(-1),
                steps,
            )?)
        };
        let s_preds = self.styles(&caller, sampler, &style, &bert_dur, inputs.ref_style)?;
        let s_dur = s_preds.index((.., self.style_dim..));

        let logits = caller.first(
            names::PREDICTOR,
            Entry::Durations,
            &[&d_en, &s_dur, &lengths_array, &text_mask],
        )?;
        let probs = sigmoid(&logits)?;
        probs.eval()?;
        let k = probs.dim(2) as usize;
        let rows = probs.dim(1) as usize;
        let values = probs.as_slice::<f32>();
        let frames: Vec<i32> = lengths
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                let start = b * rows * k;
                let end = start + (len.max(0) as usize).min(rows) * k;
                values[start..end].iter().sum::<f32>().round() as i32
            })
            .collect();

        let min_frames = frames.iter().copied().min().unwrap_or(0);
        let mel_len = mel_clip_len(min_frames)
            .max(self.params.min_len as i32 / 2)
            .min(self.params.max_len as i32 / 2);

        let limit = self.params.batch_percentage * batch as f32;
        let mut clips = Vec::new();
        let mut wavs = Vec::new();
        for b in 0..batch {
            let pred_frames = frames[b];
            let gt_frames = inputs.mel_lengths[b] / 2;
            if gt_frames <= mel_len || pred_frames <= mel_len {
                continue;
            }
            let pred_offset = rng.gen_range(0..pred_frames - mel_len);
            let gt_offset = rng.gen_range(0..gt_frames - mel_len);
            clips.push(Clip {
                index: b,
                pred_offset,
            });
            let samples = crop_wave(
                &inputs.waves[b],
                (2 * gt_offset * self.hop) as usize,
                (2 * mel_len * self.hop) as usize,
            );
            wavs.push(Array::from_slice(&samples, &[1, samples.len() as i32]));
            if wavs.len() as f32 >= limit {
                break;
            }
        }

        if clips.len() <= 1 {
            debug!(kept = clips.len(), mel_len, "adversarial stage skipped: too few clips");
            return Ok(None);
        }

        let critic = if (inputs.step + 1) % self.params.iter.max(1) == 0 {
            Some(CriticPlan {
                use_rec: rng.gen_bool(0.5),
                use_crop: rng.gen_bool(0.5),
            })
        } else {
            None
        };

        let t_en = caller.first(
            names::TEXT_ENCODER,
            Entry::Forward,
            &[inputs.ref_texts, &lengths_array, &text_mask],
        )?;

        Ok(Some(AdversarialPlan {
            texts: inputs.ref_texts.clone(),
            lengths,
            lengths_array,
            text_mask,
            attention_mask,
            t_en: mlx_rs::stop_gradient(&t_en)?,
            style,
            frames,
            mel_len,
            clips,
            wav: stack_axis(&wavs, 0)?,
            critic,
        }))
    }

    /// Synthesize the kept clips; returns `[n, 1, S]`.
    pub fn synthesize(
        &self,
        caller: &UnitCaller<'_>,
        sampler: &StyleSampler,
        plan: &AdversarialPlan,
        ref_style: Option<&Array>,
    ) -> MlxResult<Array> {
        let (bert_dur, d_en) = self.encode_text(caller, &plan.texts, &plan.attention_mask)?;
        let s_preds = self.styles(caller, sampler, &plan.style, &bert_dur, ref_style)?;
        let s_dur = s_preds.index((.., self.style_dim..));

        let logits = caller.first(
            names::PREDICTOR,
            Entry::Durations,
            &[&d_en, &s_dur, &plan.lengths_array, &plan.text_mask],
        )?;
        let max_tokens = logits.dim(1);
        let max_frames = plan.frames.iter().copied().max().unwrap_or(0).max(1);
        let attn = plan
            .lengths
            .iter()
            .zip(&plan.frames)
            .enumerate()
            .map(|(b, (&len, &frames))| {
                let rows = logits.index((b as i32, ..len.min(max_tokens), ..));
                gaussian_upsample(&rows, frames, self.params.sig, max_tokens, max_frames)
            })
            .collect::<MlxResult<Vec<_>>>()?;
        let attn = stack_axis(&attn, 0)?;

        let asr_pred = plan.t_en.matmul(&attn)?;
        let prosody = caller.call(
            names::PREDICTOR,
            Entry::Forward,
            &[&d_en, &s_dur, &plan.lengths_array, &attn, &plan.text_mask],
        )?;
        let p_pred = prosody
            .get(1)
            .ok_or_else(|| Exception::custom("predictor returned no prosody features"))?;

        let len = plan.mel_len;
        let mut en = Vec::with_capacity(plan.clips.len());
        let mut p_en = Vec::with_capacity(plan.clips.len());
        let mut sp = Vec::with_capacity(plan.clips.len());
        for clip in &plan.clips {
            let b = clip.index as i32;
            let range = clip.pred_offset..clip.pred_offset + len;
            en.push(asr_pred.index((b, .., range.clone())));
            p_en.push(p_pred.index((b, .., range)));
            sp.push(s_preds.index(b));
        }
        let en = stack_axis(&en, 0)?;
        let p_en = stack_axis(&p_en, 0)?;
        let sp = stack_axis(&sp, 0)?;

        let acoustic = sp.index((.., ..self.style_dim));
        let prosodic = sp.index((.., self.style_dim..));
        let curves = caller.call(names::PREDICTOR, Entry::F0N, &[&p_en, &prosodic])?;
        if curves.len() < 2 {
            return Err(Exception::custom("predictor F0N returned fewer than two curves"));
        }
        caller.first(
            names::DECODER,
            Entry::Forward,
            &[&en, &curves[0], &curves[1], &acoustic],
        )
    }

    /// Critic loss of one planned update, with detached inputs.
    pub fn critic_loss(
        &self,
        caller: &UnitCaller<'_>,
        coins: CriticPlan,
        plan: &AdversarialPlan,
        y_pred: &Array,
        y_rec_gt: &Array,
        y_rec_gt_pred: &Array,
    ) -> MlxResult<Array> {
        let y_pred = mlx_rs::stop_gradient(y_pred)?;
        let critic = &self.critic;
        if !coins.use_rec {
            return critic.discriminator(caller, &plan.wav, &y_pred);
        }

        let wav = mlx_rs::stop_gradient(y_rec_gt_pred)?;
        let crop = wav.dim(-1).min(y_pred.dim(-1));
        let longest_is_real = wav.dim(-1) > y_pred.dim(-1);
        let (longer, shorter_real) = if longest_is_real {
            (wav.clone(), true)
        } else {
            (y_pred.clone(), false)
        };
        let cropped = longer.index((.., .., ..crop));

        let out_crop = critic.discriminator_forward(caller, &cropped)?;
        let out_org = critic.discriminator_forward(caller, &longer)?;
        let width = out_crop.dim(-1).min(out_org.dim(-1));
        let loss_reg = l1_loss(
            &out_crop.index((.., ..width)),
            &out_org.index((.., ..width)),
        )?;

        let d_loss = match (shorter_real, coins.use_crop) {
            (true, true) => critic.discriminator(caller, &cropped, &y_pred)?,
            (false, true) => critic.discriminator(caller, &wav, &cropped)?,
            _ => critic.discriminator(caller, &wav, &y_pred)?,
        };

        let out_gt = critic.discriminator_forward(caller, y_rec_gt)?;
        let out_rec = critic.discriminator_forward(caller, &wav)?;
        let artifacts = l1_loss(&out_gt, &out_rec)?;
        d_loss.add(&loss_reg)?.add(&artifacts)
    }

    /// Plan and apply one adversarial step.
    ///
    /// Returns `None` when the stage skipped itself; nothing is stepped then.
    pub fn run(
        &self,
        registry: &mut ModelRegistry,
        optimizer: &mut MultiOptimizer,
        sampler: &StyleSampler,
        inputs: &AdversarialInputs<'_>,
        rng: &mut StdRng,
    ) -> Result<Option<AdversarialOutcome>> {
        let Some(plan) = self.plan(registry, sampler, inputs, rng)? else {
            return Ok(None);
        };

        let mut units = vec![names::BERT_ENCODER, names::BERT, names::PREDICTOR];
        if plan.samples_styles() {
            units.push(names::DIFFUSION);
        }
        let params = registry.flat_parameters(&units)?;
        let (values, grads) = {
            let registry: &ModelRegistry = registry;
            let ref_style = inputs.ref_style;
            let plan = &plan;
            differentiate(params, |params: HashMap<Rc<str>, Array>, _: ()| {
                let caller = UnitCaller::with_flat(registry, &params);
                let y_pred = self.synthesize(&caller, sampler, plan, ref_style)?;
                let gen_loss = self.critic.generator(&caller, &y_pred)?;
                Ok(vec![gen_loss, y_pred])
            })?
        };
        let gen_loss = scalar(&values[0])?;
        let y_pred = mlx_rs::stop_gradient(&values[1])?;

        optimizer.zero_grad();
        optimizer.backward(grads)?;
        let surgery = self.surgery().apply(optimizer)?;
        for unit in GENERATOR_UNITS {
            optimizer.step(unit, registry)?;
        }

        let mut d_loss = 0.0;
        if let Some(coins) = plan.critic {
            let params = registry.flat_parameters(&[names::WD])?;
            let (values, grads) = {
                let registry: &ModelRegistry = registry;
                let plan = &plan;
                let y_pred = &y_pred;
                differentiate(params, |params: HashMap<Rc<str>, Array>, _: ()| {
                    let caller = UnitCaller::with_flat(registry, &params);
                    let loss = self.critic_loss(
                        &caller,
                        coins,
                        plan,
                        y_pred,
                        inputs.y_rec_gt,
                        inputs.y_rec_gt_pred,
                    )?;
                    Ok(vec![loss])
                })?
            };
            d_loss = scalar(&values[0])?;
            if d_loss != 0.0 {
                optimizer.zero_grad();
                optimizer.backward(grads)?;
                optimizer.step(names::WD, registry)?;
            }
        }

        debug!(
            gen_loss,
            d_loss,
            kept = plan.clips.len(),
            predictor_norm = surgery.predictor_norm,
            rescaled = surgery.rescaled,
            "adversarial step"
        );

        Ok(Some(AdversarialOutcome {
            d_loss,
            gen_loss,
            y_pred,
            surgery,
        }))
    }
}

fn scalar(value: &Array) -> MlxResult<f32> {
    value.eval()?;
    Ok(value.item::<f32>())
}
