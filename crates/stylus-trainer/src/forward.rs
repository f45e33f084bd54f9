//! The per-batch forward stage.
//!
//! [`ForwardStage::prepare`] runs the model once without differentiation and
//! takes every host decision of the step: the monotonic path, the
//! soft/hard alignment coin, the clip offsets, the sampler noise. The
//! discriminator and generator steps then replay the same computation under
//! `keyed_value_and_grad`, which only sees the parameters of the units it is
//! asked to differentiate.
//!
//! Degenerate batches are not errors. `prepare` returns a [`SkipReason`] and
//! nothing is stepped.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use mlx_rs::error::Exception;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::ops::{concatenate_axis, stack_axis};
use mlx_rs::transforms::keyed_value_and_grad;
use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::Rng;
use stylus_audio::audio::log_norm;
use stylus_audio::loss::{
    discriminator_loss, generator_loss, l1_loss, smooth_l1_loss, DiscriminatorOutput,
    MultiResolutionStftLoss,
};
use stylus_core::{LossWeights, TrainConfig};
use tracing::debug;

use crate::alignment::{
    downsampled_lengths, durations, length_to_mask, maximum_path, valid_mask,
};
use crate::data::Batch;
use crate::losses::{duration_losses, mono_loss, s2s_loss};
use crate::multi_optimizer::MultiOptimizer;
use crate::registry::{names, ModelRegistry, UnitCaller};
use crate::slm::SpeechLmCritic;
use crate::style_sampler::{estimate_sigma_data, LossDraw, SamplerDraw, StyleSampler};
use crate::unit::Entry;
use crate::Result;

type MlxResult<T> = std::result::Result<T, Exception>;

/// Narrowest ground-truth clip, in mel frames, the decoder accepts.
pub const MIN_DECODER_WIDTH: i32 = 80;

/// Units differentiated by the waveform discriminator step.
pub const DISCRIMINATOR_UNITS: [&str; 2] = [names::MSD, names::MPD];

/// Units differentiated and stepped by the generator step, in step order.
/// `diffusion` is added while the diffusion group is active.
pub const GENERATOR_UNITS: [&str; 8] = [
    names::BERT_ENCODER,
    names::BERT,
    names::PREDICTOR,
    names::PREDICTOR_ENCODER,
    names::STYLE_ENCODER,
    names::DECODER,
    names::TEXT_ENCODER,
    names::TEXT_ALIGNER,
];

/// Clip length `trunc(min_len / 2 - 1)` in aligner frames.
pub fn mel_clip_len(min_len: i32) -> i32 {
    (min_len as f32 / 2.0 - 1.0) as i32
}

/// Whether a ground-truth clip of `width` mel frames can be decoded.
pub fn crop_width_ok(width: i32) -> bool {
    width >= MIN_DECODER_WIDTH
}

/// `len` samples starting at `start`, zero-padded past the end.
pub fn crop_wave(wave: &[f32], start: usize, len: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; len];
    if start < wave.len() {
        let end = (start + len).min(wave.len());
        out[..end - start].copy_from_slice(&wave[start..end]);
    }
    out
}

/// Value and gradients of the first output of `f` with respect to `params`.
pub fn differentiate<'a, F>(
    params: HashMap<Rc<str>, Array>,
    f: F,
) -> MlxResult<(Vec<Array>, HashMap<Rc<str>, Array>)>
where
    F: FnMut(HashMap<Rc<str>, Array>, ()) -> MlxResult<Vec<Array>> + 'a,
{
    let mut vg = keyed_value_and_grad(f);
    vg(params, ())
}

/// Why a batch was not used.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// No monotonic path exists for the aligner output.
    Alignment(String),
    /// The ground-truth clip is narrower than the decoder floor.
    NarrowCrop {
        /// Clip width in mel frames.
        width: i32,
        /// Required width.
        floor: i32,
    },
    /// A unit failed on this batch.
    Forward(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alignment(msg) => write!(f, "alignment failed: {msg}"),
            Self::NarrowCrop { width, floor } => {
                write!(f, "clip of {width} frames is narrower than {floor}")
            }
            Self::Forward(msg) => write!(f, "forward failed: {msg}"),
        }
    }
}

fn forward_failed(err: impl fmt::Display) -> SkipReason {
    SkipReason::Forward(err.to_string())
}

/// Settings of the forward stage taken from the run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardConfig {
    /// Waveform samples per mel frame.
    pub hop: i32,
    /// Aligner stride exponent.
    pub n_down: u32,
    /// Width of each style half.
    pub style_dim: i32,
    /// Longest training clip in mel frames.
    pub max_len: i32,
    /// Condition the denoiser on reference styles.
    pub multispeaker: bool,
    /// Re-estimate `sigma_data` from every batch.
    pub estimate_sigma: bool,
    /// Generator loss weights.
    pub weights: LossWeights,
}

impl ForwardConfig {
    /// Settings of a run.
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            hop: config.hop_length() as i32,
            n_down: config.model_params.n_down,
            style_dim: config.model_params.style_dim as i32,
            max_len: config.max_len as i32,
            multispeaker: config.model_params.multispeaker,
            estimate_sigma: config.model_params.diffusion.dist.estimate_sigma_data,
            weights: config.loss_params.weights,
        }
    }
}

/// Clip geometry of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crops {
    /// Reconstruction clip length in aligner frames.
    pub mel_len: i32,
    /// Style-reference clip length in aligner frames.
    pub mel_len_st: i32,
    /// Reconstruction clip offset per utterance.
    pub offsets: Vec<i32>,
    /// Style-reference clip offset per utterance.
    pub st_offsets: Vec<i32>,
}

impl Crops {
    /// Draw offsets for `mel_lengths`; `max_len` caps the reconstruction clip.
    pub fn draw(mel_lengths: &[i32], max_len: Option<i32>, rng: &mut StdRng) -> Self {
        let min = mel_lengths.iter().copied().min().unwrap_or(0);
        let mel_len_st = mel_clip_len(min);
        let mel_len = match max_len {
            Some(max_len) => mel_len_st.min(max_len / 2),
            None => mel_len_st,
        };
        let mut offsets = Vec::with_capacity(mel_lengths.len());
        let mut st_offsets = Vec::with_capacity(mel_lengths.len());
        for &len in mel_lengths {
            let frames = len / 2;
            offsets.push(rng.gen_range(0..(frames - mel_len).max(1)));
            st_offsets.push(rng.gen_range(0..(frames - mel_len_st).max(1)));
        }
        Self {
            mel_len,
            mel_len_st,
            offsets,
            st_offsets,
        }
    }

    /// Ground-truth clip width in mel frames.
    pub fn width(&self) -> i32 {
        2 * self.mel_len
    }

    /// Aligner-rate clips `[B, C, mel_len]` of `x` `[B, C, T']`.
    pub fn aligned(&self, x: &Array) -> MlxResult<Array> {
        let clips: Vec<Array> = self
            .offsets
            .iter()
            .enumerate()
            .map(|(b, &o)| x.index((b as i32, .., o..o + self.mel_len)))
            .collect();
        stack_axis(&clips, 0)
    }

    /// Mel clips `[B, M, 2 * mel_len]`.
    pub fn mels(&self, mels: &Array) -> MlxResult<Array> {
        self.mel_clips(mels, &self.offsets, self.mel_len)
    }

    /// Style-reference mel clips `[B, M, 2 * mel_len_st]`.
    pub fn style_reference(&self, mels: &Array) -> MlxResult<Array> {
        self.mel_clips(mels, &self.st_offsets, self.mel_len_st)
    }

    fn mel_clips(&self, mels: &Array, offsets: &[i32], len: i32) -> MlxResult<Array> {
        let clips: Vec<Array> = offsets
            .iter()
            .enumerate()
            .map(|(b, &o)| mels.index((b as i32, .., 2 * o..2 * (o + len))))
            .collect();
        stack_axis(&clips, 0)
    }

    /// Waveform clips `[B, 1, 2 * mel_len * hop]`.
    pub fn waves(&self, waves: &[Vec<f32>], hop: i32) -> MlxResult<Array> {
        let len = (2 * self.mel_len * hop).max(0) as usize;
        let clips: Vec<Array> = waves
            .iter()
            .zip(&self.offsets)
            .map(|(wave, &o)| {
                let samples = crop_wave(wave, (2 * o * hop).max(0) as usize, len);
                Array::from_slice(&samples, &[1, len as i32])
            })
            .collect();
        stack_axis(&clips, 0)
    }
}

/// Sampler draws of one step with the diffusion group active.
#[derive(Debug, Clone)]
pub struct DiffusionPlan {
    /// Style sampling draw.
    pub sample: SamplerDraw,
    /// Denoising loss draw.
    pub loss: LossDraw,
    /// `sigma_data` estimated from this batch's target styles.
    pub sigma_estimate: Option<f32>,
}

/// Scalar losses of one training step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepLosses {
    /// Weighted generator objective.
    pub total: f32,
    /// Multi-resolution STFT loss.
    pub mel: f32,
    /// Waveform discriminator loss.
    pub disc: f32,
    /// Waveform generator loss.
    pub gen: f32,
    /// Speech-LM feature loss.
    pub lm: f32,
    /// Duration L1.
    pub dur: f32,
    /// Duration cross-entropy.
    pub ce: f32,
    /// Phoneme recognition.
    pub s2s: f32,
    /// Alignment consistency.
    pub mono: f32,
    /// Pitch reconstruction.
    pub f0: f32,
    /// Energy reconstruction.
    pub norm: f32,
    /// Style reconstruction.
    pub sty: f32,
    /// Denoising loss.
    pub diff: f32,
}

/// Scalar losses of one validation batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidationLosses {
    /// Multi-resolution STFT loss.
    pub mel: f32,
    /// Duration L1.
    pub dur: f32,
    /// Pitch L1 divided by 10.
    pub f0: f32,
}

/// Detached tensors derived from the batch that every replay shares.
#[derive(Debug, Clone)]
struct BatchTensors {
    lengths: Array,
    text_mask: Array,
    attention_mask: Array,
    frame_mask: Array,
}

impl BatchTensors {
    fn new(batch: &Batch, n_down: u32) -> Self {
        let max_tokens = batch.texts.dim(1);
        let frames = downsampled_lengths(&batch.mel_lengths, n_down);
        let max_frames = batch.mels.dim(2) >> n_down;
        Self {
            lengths: Array::from_slice(&batch.input_lengths, &[batch.batch_size() as i32]),
            text_mask: length_to_mask(&batch.input_lengths, max_tokens),
            attention_mask: valid_mask(&batch.input_lengths, max_tokens),
            frame_mask: length_to_mask(&frames, max_frames),
        }
    }
}

/// Aligner outputs with the start row of the attention dropped.
fn align(caller: &UnitCaller<'_>, batch: &Batch, t: &BatchTensors) -> MlxResult<(Array, Array)> {
    let outs = caller.call(
        names::TEXT_ALIGNER,
        Entry::Forward,
        &[&batch.mels, &t.frame_mask, &batch.texts],
    )?;
    if outs.len() < 3 {
        return Err(Exception::custom("text_aligner returned fewer than three outputs"));
    }
    Ok((outs[1].clone(), outs[2].index((.., 1.., ..))))
}

/// Style of every utterance over its own valid frames, `[B, S]`.
fn utterance_styles(caller: &UnitCaller<'_>, unit: &str, batch: &Batch) -> MlxResult<Array> {
    let m = batch.mels.dim(1);
    let styles = batch
        .mel_lengths
        .iter()
        .enumerate()
        .map(|(b, &len)| {
            let mel = batch.mels.index((b as i32, .., ..len)).reshape(&[1, 1, m, len])?;
            caller.first(unit, Entry::Forward, &[&mel])
        })
        .collect::<MlxResult<Vec<_>>>()?;
    concatenate_axis(&styles, 0)
}

fn as_image(mel: &Array) -> MlxResult<Array> {
    mel.reshape(&[mel.dim(0), 1, mel.dim(1), mel.dim(2)])
}

fn flat_wave(wave: &Array) -> MlxResult<Array> {
    wave.reshape(&[wave.dim(0), -1])
}

fn discriminator_output(
    caller: &UnitCaller<'_>,
    unit: &str,
    wave: &Array,
) -> MlxResult<DiscriminatorOutput> {
    let outs = caller.call(unit, Entry::Forward, &[wave])?;
    let heads = caller.unit(unit)?.num_heads();
    Ok(DiscriminatorOutput::from_flat(outs, heads)?)
}

fn scalar(value: &Array) -> MlxResult<f32> {
    value.eval()?;
    Ok(value.item::<f32>())
}

/// Outputs of one generator replay.
struct Synthesis {
    s2s_pred: Array,
    attn: Array,
    logits: Array,
    bert_dur: Array,
    en: Array,
    style: Array,
    f0_fake: Array,
    n_fake: Array,
    y_rec: Array,
}

/// One training batch with every host decision taken.
#[derive(Debug)]
pub struct ForwardStage<'a> {
    batch: &'a Batch,
    config: ForwardConfig,
    tensors: BatchTensors,
    mono: Array,
    durations: Vec<Vec<i32>>,
    soft_alignment: bool,
    crops: Crops,
    gt: Array,
    wav: Array,
    f0_real: Array,
    n_real: Array,
    s_trg: Array,
    ref_style: Option<Array>,
    diffusion: Option<DiffusionPlan>,
    y_rec_gt_pred: Array,
    y_rec: Array,
}

impl<'a> ForwardStage<'a> {
    /// Run the batch once and take every host decision.
    pub fn prepare(
        config: &ForwardConfig,
        registry: &ModelRegistry,
        sampler: &StyleSampler,
        batch: &'a Batch,
        diffusion_active: bool,
        rng: &mut StdRng,
    ) -> std::result::Result<Self, SkipReason> {
        let caller = UnitCaller::new(registry);
        let tensors = BatchTensors::new(batch, config.n_down);

        let ref_style = if diffusion_active && config.multispeaker {
            let ref_mels = as_image(&batch.ref_mels).map_err(forward_failed)?;
            let acoustic = caller
                .first(names::STYLE_ENCODER, Entry::Forward, &[&ref_mels])
                .map_err(forward_failed)?;
            let prosodic = caller
                .first(names::PREDICTOR_ENCODER, Entry::Forward, &[&ref_mels])
                .map_err(forward_failed)?;
            let joined = concatenate_axis(&[acoustic, prosodic], 1).map_err(forward_failed)?;
            Some(mlx_rs::stop_gradient(&joined).map_err(forward_failed)?)
        } else {
            None
        };

        let (_, attn) = align(&caller, batch, &tensors).map_err(forward_failed)?;
        let frames = downsampled_lengths(&batch.mel_lengths, config.n_down);
        let mono = maximum_path(&attn, &batch.input_lengths, &frames)
            .map_err(|e| SkipReason::Alignment(e.to_string()))?;
        let durations = durations(&mono).map_err(|e| SkipReason::Alignment(e.to_string()))?;
        let soft_alignment = rng.gen_bool(0.5);

        let acoustic = utterance_styles(&caller, names::STYLE_ENCODER, batch).map_err(forward_failed)?;
        let prosodic =
            utterance_styles(&caller, names::PREDICTOR_ENCODER, batch).map_err(forward_failed)?;
        let s_trg = concatenate_axis(&[acoustic, prosodic], -1)
            .and_then(|s| mlx_rs::stop_gradient(&s))
            .map_err(forward_failed)?;

        let diffusion = if diffusion_active {
            let (b, width) = (s_trg.dim(0), s_trg.dim(-1));
            let steps = rng.gen_range(3..5);
            let sigma_estimate = if config.estimate_sigma {
                estimate_sigma_data(&s_trg).map_err(forward_failed)?
            } else {
                None
            };
            Some(DiffusionPlan {
                sample: sampler.draw_sampler(rng, b, width, steps).map_err(forward_failed)?,
                loss: sampler
                    .draw_loss(rng, b, width, ref_style.is_some())
                    .map_err(forward_failed)?,
                sigma_estimate,
            })
        } else {
            None
        };

        let crops = Crops::draw(&batch.mel_lengths, Some(config.max_len), rng);
        if !crop_width_ok(crops.width()) {
            return Err(SkipReason::NarrowCrop {
                width: crops.width(),
                floor: MIN_DECODER_WIDTH,
            });
        }

        let mut stage = Self {
            batch,
            config: config.clone(),
            tensors,
            mono,
            durations,
            soft_alignment,
            gt: crops.mels(&batch.mels).map_err(forward_failed)?,
            wav: crops.waves(&batch.waves, config.hop).map_err(forward_failed)?,
            crops,
            f0_real: Array::from_f32(0.0),
            n_real: Array::from_f32(0.0),
            s_trg,
            ref_style,
            diffusion,
            y_rec_gt_pred: Array::from_f32(0.0),
            y_rec: Array::from_f32(0.0),
        };

        let gt_image = as_image(&stage.gt).map_err(forward_failed)?;
        stage.f0_real = caller
            .first(names::PITCH_EXTRACTOR, Entry::Forward, &[&gt_image])
            .and_then(|f0| mlx_rs::stop_gradient(&f0))
            .map_err(forward_failed)?;
        stage.n_real = log_norm(&stage.gt)
            .map_err(forward_failed)
            .and_then(|n| mlx_rs::stop_gradient(&n).map_err(forward_failed))?;

        let synthesis = stage.synthesize(&caller).map_err(forward_failed)?;
        stage.y_rec_gt_pred = caller
            .first(
                names::DECODER,
                Entry::Forward,
                &[&synthesis.en, &stage.f0_real, &stage.n_real, &synthesis.style],
            )
            .and_then(|y| mlx_rs::stop_gradient(&y))
            .map_err(forward_failed)?;
        stage.y_rec = mlx_rs::stop_gradient(&synthesis.y_rec).map_err(forward_failed)?;

        debug!(
            mel_len = stage.crops.mel_len,
            soft_alignment,
            diffusion = stage.diffusion.is_some(),
            "forward stage prepared"
        );
        Ok(stage)
    }

    /// Clip geometry.
    pub fn crops(&self) -> &Crops {
        &self.crops
    }

    /// Frames per token of the monotonic path.
    pub fn durations(&self) -> &[Vec<i32>] {
        &self.durations
    }

    /// Hardened alignment `[B, L, T']`.
    pub fn mono(&self) -> &Array {
        &self.mono
    }

    /// Whether the decoder features use the soft attention this step.
    pub fn uses_soft_alignment(&self) -> bool {
        self.soft_alignment
    }

    /// Diffusion draws, when the group is active.
    pub fn diffusion(&self) -> Option<&DiffusionPlan> {
        self.diffusion.as_ref()
    }

    /// Batch-wise `sigma_data` estimate.
    pub fn sigma_estimate(&self) -> Option<f32> {
        self.diffusion.as_ref().and_then(|d| d.sigma_estimate)
    }

    /// Detached target styles `[B, 2S]`.
    pub fn target_styles(&self) -> &Array {
        &self.s_trg
    }

    /// Reference styles for the denoiser.
    pub fn reference_styles(&self) -> Option<&Array> {
        self.ref_style.as_ref()
    }

    /// Ground-truth waveform clips `[B, 1, S]`.
    pub fn ground_truth_wave(&self) -> &Array {
        &self.wav
    }

    /// Decoder output on ground-truth pitch and energy `[B, 1, S]`.
    pub fn reconstruction_from_truth(&self) -> &Array {
        &self.y_rec_gt_pred
    }

    /// The replayed model computation shared by the pre-pass and the
    /// generator closure. The denoiser is not run here.
    fn synthesize(&self, caller: &UnitCaller<'_>) -> MlxResult<Synthesis> {
        let batch = self.batch;
        let t = &self.tensors;

        let (s2s_pred, attn) = align(caller, batch, t)?;
        let t_en = caller.first(
            names::TEXT_ENCODER,
            Entry::Forward,
            &[&batch.texts, &t.lengths, &t.text_mask],
        )?;
        let asr = if self.soft_alignment {
            t_en.matmul(&attn)?
        } else {
            t_en.matmul(&self.mono)?
        };

        let s_dur = utterance_styles(caller, names::PREDICTOR_ENCODER, batch)?;
        let bert_dur = caller.first(names::BERT, Entry::Forward, &[&batch.texts, &t.attention_mask])?;
        let d_en = caller
            .first(names::BERT_ENCODER, Entry::Forward, &[&bert_dur])?
            .transpose_axes(&[0, 2, 1])?;

        let outs = caller.call(
            names::PREDICTOR,
            Entry::Forward,
            &[&d_en, &s_dur, &t.lengths, &self.mono, &t.text_mask],
        )?;
        if outs.len() < 2 {
            return Err(Exception::custom("predictor returned fewer than two outputs"));
        }
        let (logits, prosody) = (outs[0].clone(), &outs[1]);

        let en = self.crops.aligned(&asr)?;
        let p_en = self.crops.aligned(prosody)?;
        let gt_image = as_image(&self.gt)?;
        let style = caller.first(names::STYLE_ENCODER, Entry::Forward, &[&gt_image])?;
        let s_dur_gt = caller.first(names::PREDICTOR_ENCODER, Entry::Forward, &[&gt_image])?;

        let curves = caller.call(names::PREDICTOR, Entry::F0N, &[&p_en, &s_dur_gt])?;
        if curves.len() < 2 {
            return Err(Exception::custom("predictor F0N returned fewer than two curves"));
        }
        let y_rec = caller.first(
            names::DECODER,
            Entry::Forward,
            &[&en, &curves[0], &curves[1], &style],
        )?;

        Ok(Synthesis {
            s2s_pred,
            attn,
            logits,
            bert_dur,
            en,
            style,
            f0_fake: curves[0].clone(),
            n_fake: curves[1].clone(),
            y_rec,
        })
    }

    /// Style reconstruction and denoising losses, zero while inactive.
    fn diffusion_losses(
        &self,
        caller: &UnitCaller<'_>,
        sampler: &StyleSampler,
        bert_dur: &Array,
    ) -> MlxResult<(Array, Array)> {
        let Some(plan) = &self.diffusion else {
            return Ok((Array::from_f32(0.0), Array::from_f32(0.0)));
        };
        let net = caller.unit(names::DIFFUSION)?;
        let params = caller.params(names::DIFFUSION)?;
        let features = self.ref_style.as_ref();
        let b = self.s_trg.dim(0);

        let s_preds = sampler
            .sample(net, params, bert_dur, features, &plan.sample)?
            .reshape(&[b, -1])?;
        let target = self.s_trg.reshape(&[b, 1, -1])?;
        let diff = sampler.loss(net, params, &target, bert_dur, features, &plan.loss)?;
        let sty = l1_loss(&s_preds, &self.s_trg)?;
        Ok((sty, diff))
    }

    /// Update `msd` and `mpd` on the ground-truth clips against the detached
    /// reconstruction. Returns the discriminator loss.
    pub fn discriminator_step(
        &self,
        registry: &mut ModelRegistry,
        optimizer: &mut MultiOptimizer,
    ) -> Result<f32> {
        let params = registry.flat_parameters(&DISCRIMINATOR_UNITS)?;
        let (values, grads) = {
            let registry: &ModelRegistry = registry;
            differentiate(params, |params: HashMap<Rc<str>, Array>, _: ()| {
                let caller = UnitCaller::with_flat(registry, &params);
                let mut total = Array::from_f32(0.0);
                for unit in DISCRIMINATOR_UNITS {
                    let real = discriminator_output(&caller, unit, &self.wav)?;
                    let fake = discriminator_output(&caller, unit, &self.y_rec)?;
                    total = total.add(&discriminator_loss(&real, &fake)?.total)?;
                }
                Ok(vec![total])
            })?
        };

        optimizer.zero_grad();
        optimizer.backward(grads)?;
        for unit in DISCRIMINATOR_UNITS {
            optimizer.step(unit, registry)?;
        }
        Ok(scalar(&values[0])?)
    }

    /// Backpropagate the weighted generator objective once and step every
    /// generator-side unit (plus `diffusion` while active).
    pub fn generator_step(
        &self,
        registry: &mut ModelRegistry,
        optimizer: &mut MultiOptimizer,
        sampler: &StyleSampler,
        stft: &MultiResolutionStftLoss,
        critic: &SpeechLmCritic,
    ) -> Result<StepLosses> {
        let mut units: Vec<&str> = GENERATOR_UNITS.to_vec();
        if self.diffusion.is_some() {
            units.push(names::DIFFUSION);
        }
        let w = self.config.weights;
        let params = registry.flat_parameters(&units)?;

        let (values, grads) = {
            let registry: &ModelRegistry = registry;
            differentiate(params, |params: HashMap<Rc<str>, Array>, _: ()| {
                let caller = UnitCaller::with_flat(registry, &params);
                let out = self.synthesize(&caller)?;
                let batch = self.batch;

                let (sty, diff) = self.diffusion_losses(&caller, sampler, &out.bert_dur)?;

                let mel = stft.compute(&flat_wave(&out.y_rec)?, &flat_wave(&self.wav)?)?;
                let mut gen = Array::from_f32(0.0);
                for unit in DISCRIMINATOR_UNITS {
                    let real = discriminator_output(&caller, unit, &self.wav)?;
                    let fake = discriminator_output(&caller, unit, &out.y_rec)?;
                    gen = gen.add(&generator_loss(&real, &fake)?.total)?;
                }
                let lm = critic.feature_loss(&caller, &self.wav, &out.y_rec)?;

                let dur = duration_losses(&out.logits, &self.durations, &batch.input_lengths)?;
                let s2s = s2s_loss(&out.s2s_pred, &batch.texts, &batch.input_lengths)?;
                let mono = mono_loss(&out.attn, &self.mono)?;
                let f0 = smooth_l1_loss(&self.f0_real, &out.f0_fake)?
                    .divide(&Array::from_f32(10.0))?;
                let norm = smooth_l1_loss(&self.n_real, &out.n_fake)?;

                let terms = [
                    (w.lambda_mel, &mel),
                    (w.lambda_f0, &f0),
                    (w.lambda_ce, &dur.ce),
                    (w.lambda_norm, &norm),
                    (w.lambda_dur, &dur.dur),
                    (w.lambda_gen, &gen),
                    (w.lambda_slm, &lm),
                    (w.lambda_sty, &sty),
                    (w.lambda_diff, &diff),
                    (w.lambda_mono, &mono),
                    (w.lambda_s2s, &s2s),
                ];
                let mut total = Array::from_f32(0.0);
                for (weight, term) in terms {
                    total = total.add(&term.multiply(&Array::from_f32(weight))?)?;
                }

                Ok(vec![
                    total, mel, gen, lm, dur.dur, dur.ce, s2s, mono, f0, norm, sty, diff,
                ])
            })?
        };

        optimizer.zero_grad();
        optimizer.backward(grads)?;
        for unit in &units {
            optimizer.step(unit, registry)?;
        }

        let v = values
            .iter()
            .map(scalar)
            .collect::<MlxResult<Vec<f32>>>()?;
        Ok(StepLosses {
            total: v[0],
            mel: v[1],
            disc: 0.0,
            gen: v[2],
            lm: v[3],
            dur: v[4],
            ce: v[5],
            s2s: v[6],
            mono: v[7],
            f0: v[8],
            norm: v[9],
            sty: v[10],
            diff: v[11],
        })
    }
}

/// Evaluate one validation batch without differentiation.
///
/// The hardened path conditions the decoder, styles come from the
/// ground-truth clip and the clip is not capped by `max_len`. Any failure
/// skips the batch.
pub fn validation_losses(
    config: &ForwardConfig,
    registry: &ModelRegistry,
    stft: &MultiResolutionStftLoss,
    batch: &Batch,
    rng: &mut StdRng,
) -> std::result::Result<ValidationLosses, SkipReason> {
    let caller = UnitCaller::new(registry);
    let t = BatchTensors::new(batch, config.n_down);

    let (_, attn) = align(&caller, batch, &t).map_err(forward_failed)?;
    let frames = downsampled_lengths(&batch.mel_lengths, config.n_down);
    let mono = maximum_path(&attn, &batch.input_lengths, &frames)
        .map_err(|e| SkipReason::Alignment(e.to_string()))?;
    let d_gt = durations(&mono).map_err(|e| SkipReason::Alignment(e.to_string()))?;

    let mut evaluate = || -> Result<ValidationLosses> {
        let t_en = caller.first(
            names::TEXT_ENCODER,
            Entry::Forward,
            &[&batch.texts, &t.lengths, &t.text_mask],
        )?;
        let asr = t_en.matmul(&mono)?;
        let s = utterance_styles(&caller, names::PREDICTOR_ENCODER, batch)?;
        let bert_dur = caller.first(names::BERT, Entry::Forward, &[&batch.texts, &t.attention_mask])?;
        let d_en = caller
            .first(names::BERT_ENCODER, Entry::Forward, &[&bert_dur])?
            .transpose_axes(&[0, 2, 1])?;
        let outs = caller.call(
            names::PREDICTOR,
            Entry::Forward,
            &[&d_en, &s, &t.lengths, &mono, &t.text_mask],
        )?;
        if outs.len() < 2 {
            return Err(crate::TrainerError::contract(names::PREDICTOR, "expected logits and prosody"));
        }

        let crops = Crops::draw(&batch.mel_lengths, None, rng);
        if crops.mel_len < 1 {
            return Err(crate::TrainerError::contract(names::DECODER, "empty validation clip"));
        }
        let en = crops.aligned(&asr)?;
        let p_en = crops.aligned(&outs[1])?;
        let gt = as_image(&crops.mels(&batch.mels)?)?;
        let wav = crops.waves(&batch.waves, config.hop)?;

        let s = caller.first(names::PREDICTOR_ENCODER, Entry::Forward, &[&gt])?;
        let curves = caller.call(names::PREDICTOR, Entry::F0N, &[&p_en, &s])?;
        if curves.len() < 2 {
            return Err(crate::TrainerError::contract(names::PREDICTOR, "expected F0 and N curves"));
        }
        let dur = duration_losses(&outs[0], &d_gt, &batch.input_lengths)?.dur;

        let s = caller.first(names::STYLE_ENCODER, Entry::Forward, &[&gt])?;
        let y_rec = caller.first(
            names::DECODER,
            Entry::Forward,
            &[&en, &curves[0], &curves[1], &s],
        )?;
        let mel = stft.compute(&flat_wave(&y_rec)?, &flat_wave(&wav)?)?;
        let f0_real = caller.first(names::PITCH_EXTRACTOR, Entry::Forward, &[&gt])?;
        let f0 = l1_loss(&f0_real, &curves[0])?.divide(&Array::from_f32(10.0))?;

        Ok(ValidationLosses {
            mel: scalar(&mel)?,
            dur: scalar(&dur)?,
            f0: scalar(&f0)?,
        })
    };
    evaluate().map_err(forward_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticBatches;
    use crate::reference::ReferenceModelBuilder;
    use rand::SeedableRng;
    use stylus_audio::loss::StftResolution;
    use stylus_core::{DistParams, OptimizerParams};

    fn config(dims: ReferenceModelBuilder) -> ForwardConfig {
        ForwardConfig {
            hop: dims.hop,
            n_down: dims.n_down,
            style_dim: dims.style_dim,
            max_len: 200,
            multispeaker: false,
            estimate_sigma: true,
            weights: LossWeights::default(),
        }
    }

    fn small_stft() -> MultiResolutionStftLoss {
        MultiResolutionStftLoss::with_resolutions(
            16000,
            &[StftResolution::new(64, 16, 48), StftResolution::new(128, 32, 96)],
            16,
        )
    }

    fn value(a: &Array) -> f32 {
        a.eval().unwrap();
        a.item::<f32>()
    }

    #[test]
    fn test_clip_len_truncates_toward_zero() {
        assert_eq!(mel_clip_len(100), 49);
        assert_eq!(mel_clip_len(81), 39);
        assert_eq!(mel_clip_len(1), 0);
        assert!(!crop_width_ok(79));
        assert!(crop_width_ok(80));
    }

    #[test]
    fn test_crop_wave_pads_with_zeros() {
        let wave = [1.0f32, 2.0, 3.0];
        assert_eq!(crop_wave(&wave, 1, 4), vec![2.0, 3.0, 0.0, 0.0]);
        assert_eq!(crop_wave(&wave, 5, 2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_crops_stay_inside_utterances() {
        let mut rng = StdRng::seed_from_u64(4);
        let lengths = [120, 96, 200];
        let crops = Crops::draw(&lengths, Some(60), &mut rng);
        assert_eq!(crops.mel_len_st, 47);
        assert_eq!(crops.mel_len, 30);
        for (b, &len) in lengths.iter().enumerate() {
            assert!(crops.offsets[b] + crops.mel_len <= len / 2);
            assert!(crops.st_offsets[b] + crops.mel_len_st <= len / 2);
        }
    }

    #[test]
    fn test_narrow_batch_is_skipped() {
        let dims = ReferenceModelBuilder::tiny();
        let registry = dims.build(0);
        let sampler = StyleSampler::new(&DistParams::default(), 0.1);
        // clip widths are even, so 78 is the widest one below the floor
        let cfg = ForwardConfig {
            max_len: 79,
            ..config(dims)
        };
        let batch = SyntheticBatches::new(dims, 2).generate(1, 0).remove(0);
        let mut rng = StdRng::seed_from_u64(0);
        match ForwardStage::prepare(&cfg, &registry, &sampler, &batch, false, &mut rng) {
            Err(SkipReason::NarrowCrop { width, floor }) => {
                assert_eq!(width, 78);
                assert_eq!(floor, MIN_DECODER_WIDTH);
            }
            other => panic!("expected a narrow crop skip, got {other:?}"),
        }
    }

    #[test]
    fn test_alignment_failure_is_a_skip() {
        let dims = ReferenceModelBuilder::tiny();
        let registry = dims.build(0);
        let sampler = StyleSampler::new(&DistParams::default(), 0.1);
        let batch = SyntheticBatches::new(dims, 2)
            .tokens(6, 6)
            .frames_per_token(2)
            .generate(1, 0)
            .remove(0);
        let mut rng = StdRng::seed_from_u64(0);
        let result = ForwardStage::prepare(&config(dims), &registry, &sampler, &batch, false, &mut rng);
        assert!(matches!(result, Err(SkipReason::Alignment(_))));
    }

    #[test]
    fn test_prepared_path_covers_every_frame() {
        let dims = ReferenceModelBuilder::tiny();
        let registry = dims.build(1);
        let sampler = StyleSampler::new(&DistParams::default(), 0.1);
        let batch = SyntheticBatches::new(dims, 3).generate(1, 2).remove(0);
        let mut rng = StdRng::seed_from_u64(1);
        let stage = ForwardStage::prepare(&config(dims), &registry, &sampler, &batch, true, &mut rng)
            .unwrap();
        let frames = downsampled_lengths(&batch.mel_lengths, dims.n_down);
        for (b, durs) in stage.durations().iter().enumerate() {
            assert_eq!(durs.iter().sum::<i32>(), frames[b]);
        }
        let st = stage.crops().style_reference(&batch.mels).unwrap();
        assert_eq!(st.shape(), &[3, dims.n_mels, 2 * stage.crops().mel_len_st]);
        assert!(stage.diffusion().is_some());
        assert!(stage.sigma_estimate().is_some());
        assert_eq!(
            stage.ground_truth_wave().shape(),
            &[3, 1, 2 * stage.crops().mel_len * dims.hop]
        );
    }

    #[test]
    fn test_inactive_diffusion_losses_are_zero() {
        let dims = ReferenceModelBuilder::tiny();
        let mut registry = dims.build(1);
        let mut optimizer = MultiOptimizer::from_config(
            &registry.trainable_names(),
            &OptimizerParams::default(),
            1,
            1,
        )
        .unwrap();
        let sampler = StyleSampler::new(&DistParams::default(), 0.1);
        let critic = SpeechLmCritic::new(16000, 16000);
        let stft = small_stft();
        let batch = SyntheticBatches::new(dims, 2).generate(1, 5).remove(0);
        let mut rng = StdRng::seed_from_u64(5);
        let stage = ForwardStage::prepare(&config(dims), &registry, &sampler, &batch, false, &mut rng)
            .unwrap();

        let diffusion_before = registry.get(names::DIFFUSION).unwrap().parameters()["bias"].clone();
        let disc = stage.discriminator_step(&mut registry, &mut optimizer).unwrap();
        let losses = stage
            .generator_step(&mut registry, &mut optimizer, &sampler, &stft, &critic)
            .unwrap();
        assert!(disc.is_finite());
        assert!(losses.total.is_finite());
        assert_eq!(losses.sty, 0.0);
        assert_eq!(losses.diff, 0.0);

        let diffusion_after = &registry.get(names::DIFFUSION).unwrap().parameters()["bias"];
        let moved = diffusion_after.subtract(&diffusion_before).unwrap().abs().unwrap().sum(None).unwrap();
        assert_eq!(value(&moved), 0.0);
        assert_eq!(optimizer.unit(names::DIFFUSION).unwrap().schedule().current_step(), 0);
        assert_eq!(optimizer.unit(names::MSD).unwrap().schedule().current_step(), 1);
        assert_eq!(optimizer.unit(names::DECODER).unwrap().schedule().current_step(), 1);
    }

    #[test]
    fn test_validation_losses_are_finite() {
        let dims = ReferenceModelBuilder::tiny();
        let registry = dims.build(3);
        let batch = SyntheticBatches::new(dims, 2).generate(1, 8).remove(0);
        let mut rng = StdRng::seed_from_u64(8);
        let losses =
            validation_losses(&config(dims), &registry, &small_stft(), &batch, &mut rng).unwrap();
        assert!(losses.mel.is_finite());
        assert!(losses.dur >= 0.0);
        assert!(losses.f0 >= 0.0);
    }
}
