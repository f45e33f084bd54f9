//! Reference units.
//!
//! Tiny differentiable stand-ins for every role of the acoustic model. They
//! honor the shape conventions of [`crate::unit`] so that the complete
//! curriculum (alignment, diffusion, both adversarial stages, checkpoints)
//! runs end to end in tests and in the smoke command without real networks.
//!
//! Each unit is a handful of affine maps with `tanh` activations; weights are
//! drawn from a seeded host RNG.

use std::rc::Rc;

use mlx_rs::error::Exception;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::ops::{broadcast_to, concatenate_axis, softmax_axis, tanh};
use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stylus_core::TrainConfig;

use crate::registry::{names, ModelRegistry};
use crate::unit::{param, Entry, TrainableUnit, UnitParams};

type MlxResult<T> = std::result::Result<T, Exception>;

/// Dimensions of the reference model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceModelBuilder {
    /// Token vocabulary size.
    pub vocab: i32,
    /// Mel bands.
    pub n_mels: i32,
    /// Aligner stride exponent (frames are downsampled by `2^n_down`).
    pub n_down: u32,
    /// Acoustic text channels.
    pub channels: i32,
    /// Language model width.
    pub bert_dim: i32,
    /// Width of the projected text features fed to the predictor.
    pub predictor_dim: i32,
    /// Width of each style half.
    pub style_dim: i32,
    /// Hidden width of the predictor and denoiser.
    pub hidden: i32,
    /// Duration logit bins.
    pub max_dur: i32,
    /// Waveform samples per mel frame.
    pub hop: i32,
    /// Samples per speech-LM frame.
    pub slm_frame: i32,
    /// Speech-LM hidden width.
    pub slm_dim: i32,
    /// Speech-LM hidden layers.
    pub slm_layers: i32,
}

impl ReferenceModelBuilder {
    /// Smallest useful model.
    pub fn tiny() -> Self {
        Self {
            vocab: 12,
            n_mels: 8,
            n_down: 1,
            channels: 8,
            bert_dim: 8,
            predictor_dim: 8,
            style_dim: 4,
            hidden: 8,
            max_dur: 6,
            hop: 4,
            slm_frame: 8,
            slm_dim: 6,
            slm_layers: 2,
        }
    }

    /// Tiny model with mel bands, stride, style width and hop from a config.
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            n_mels: config.model_params.n_mels as i32,
            n_down: config.model_params.n_down,
            style_dim: config.model_params.style_dim as i32,
            hop: config.hop_length() as i32,
            ..Self::tiny()
        }
    }

    /// Set the waveform hop.
    #[must_use]
    pub fn with_hop(mut self, hop: i32) -> Self {
        self.hop = hop;
        self
    }

    /// Set the token vocabulary size.
    #[must_use]
    pub fn with_vocab(mut self, vocab: i32) -> Self {
        self.vocab = vocab;
        self
    }

    /// Build a complete registry with weights drawn from `seed`.
    pub fn build(&self, seed: u64) -> ModelRegistry {
        let mut init = Init::new(seed);
        let d = *self;
        let s = d.style_dim;

        let unit = |role: Role, params: Vec<(String, Array)>| -> Box<dyn TrainableUnit> {
            Box::new(ReferenceUnit::new(role, d, params))
        };

        let aligner = unit(
            Role::TextAligner,
            vec![
                ("embedding".into(), init.normal(&[d.vocab, d.hidden])),
                ("start".into(), init.normal(&[1, d.hidden])),
                ("frame_proj".into(), init.normal(&[d.n_mels, d.hidden])),
                ("out_proj".into(), init.normal(&[d.hidden, d.vocab])),
            ],
        );
        let text_encoder = unit(
            Role::TextEncoder,
            vec![
                ("embedding".into(), init.normal(&[d.vocab, d.channels])),
                ("proj.weight".into(), init.normal(&[d.channels, d.channels])),
                ("proj.bias".into(), init.zeros(&[d.channels])),
            ],
        );
        let bert = unit(
            Role::Bert,
            vec![
                ("embedding".into(), init.normal(&[d.vocab, d.bert_dim])),
                ("layer.weight".into(), init.normal(&[d.bert_dim, d.bert_dim])),
                ("layer.bias".into(), init.zeros(&[d.bert_dim])),
            ],
        );
        let bert_encoder = unit(
            Role::Linear,
            vec![
                ("weight".into(), init.normal(&[d.bert_dim, d.predictor_dim])),
                ("bias".into(), init.zeros(&[d.predictor_dim])),
            ],
        );
        let style_encoder = |init: &mut Init| {
            unit(
                Role::StyleEncoder,
                vec![
                    ("proj.weight".into(), init.normal(&[d.n_mels, s])),
                    ("proj.bias".into(), init.zeros(&[s])),
                ],
            )
        };
        let predictor = unit(
            Role::Predictor,
            vec![
                ("lstm.weight".into(), init.normal(&[d.predictor_dim + s, d.hidden])),
                ("lstm.bias".into(), init.zeros(&[d.hidden])),
                ("duration_proj.weight".into(), init.normal(&[d.hidden, d.max_dur])),
                ("duration_proj.bias".into(), init.zeros(&[d.max_dur])),
                ("shared.weight".into(), init.normal(&[d.hidden, d.channels])),
                ("f0_proj.weight".into(), init.normal(&[d.channels, 1])),
                ("f0_style.weight".into(), init.normal(&[s, 1])),
                ("n_proj.weight".into(), init.normal(&[d.channels, 1])),
                ("n_style.weight".into(), init.normal(&[s, 1])),
            ],
        );
        let pitch_extractor = unit(
            Role::PitchExtractor,
            vec![("weight".into(), init.normal(&[d.n_mels, 1]))],
        );
        let decoder = unit(
            Role::Decoder,
            vec![
                ("asr.weight".into(), init.normal(&[d.channels, 1])),
                ("f0.weight".into(), init.normal(&[1])),
                ("n.weight".into(), init.normal(&[1])),
                ("style.weight".into(), init.normal(&[s, 1])),
                ("bias".into(), init.zeros(&[1])),
            ],
        );
        let discriminator = |init: &mut Init, periods: Vec<i32>| {
            let mut params = Vec::new();
            for (k, &p) in periods.iter().enumerate() {
                params.push((format!("head{k}.weight"), init.normal(&[p, d.hidden])));
                params.push((format!("head{k}.bias"), init.zeros(&[d.hidden])));
                params.push((format!("head{k}.out"), init.normal(&[d.hidden, 1])));
            }
            unit(Role::Discriminator(periods), params)
        };
        let mut slm_params = vec![("layer0.weight".to_string(), init.normal(&[d.slm_frame, d.slm_dim]))];
        for l in 1..d.slm_layers {
            slm_params.push((format!("layer{l}.weight"), init.normal(&[d.slm_dim, d.slm_dim])));
        }
        let slm = unit(Role::SpeechLm, slm_params);
        let wd = unit(
            Role::FrameCritic,
            vec![
                ("weight".into(), init.normal(&[d.slm_layers * d.slm_dim, 1])),
                ("bias".into(), init.zeros(&[1])),
            ],
        );
        let diffusion = unit(
            Role::Denoiser,
            vec![
                ("x.weight".into(), init.normal(&[2 * s, d.hidden])),
                ("embedding.weight".into(), init.normal(&[d.bert_dim, d.hidden])),
                ("fixed_embedding".into(), init.normal(&[d.bert_dim])),
                ("time.weight".into(), init.normal(&[d.hidden])),
                ("features.weight".into(), init.normal(&[2 * s, d.hidden])),
                ("bias".into(), init.zeros(&[d.hidden])),
                ("out.weight".into(), init.normal(&[d.hidden, 2 * s])),
            ],
        );

        let style = style_encoder(&mut init);
        let prosody = style_encoder(&mut init);
        let mpd = discriminator(&mut init, vec![2, 3]);
        let msd = discriminator(&mut init, vec![4]);

        ModelRegistry::new()
            .with(names::TEXT_ALIGNER, aligner)
            .with(names::TEXT_ENCODER, text_encoder)
            .with(names::BERT, bert)
            .with(names::BERT_ENCODER, bert_encoder)
            .with(names::STYLE_ENCODER, style)
            .with(names::PREDICTOR_ENCODER, prosody)
            .with(names::PREDICTOR, predictor)
            .with(names::PITCH_EXTRACTOR, pitch_extractor)
            .with(names::DECODER, decoder)
            .with(names::MPD, mpd)
            .with(names::MSD, msd)
            .with(names::SLM, slm)
            .with(names::WD, wd)
            .with(names::DIFFUSION, diffusion)
    }
}

struct Init {
    rng: StdRng,
}

impl Init {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn normal(&mut self, shape: &[i32]) -> Array {
        let n: i32 = shape.iter().product();
        let scale = 1.0 / (shape[0].max(1) as f32).sqrt();
        let data: Vec<f32> = (0..n)
            .map(|_| (self.rng.gen::<f32>() * 2.0 - 1.0) * scale)
            .collect();
        Array::from_slice(&data, shape)
    }

    fn zeros(&mut self, shape: &[i32]) -> Array {
        let n: i32 = shape.iter().product();
        Array::from_slice(&vec![0.0f32; n as usize], shape)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    TextAligner,
    TextEncoder,
    Bert,
    Linear,
    StyleEncoder,
    Predictor,
    PitchExtractor,
    Decoder,
    Discriminator(Vec<i32>),
    SpeechLm,
    FrameCritic,
    Denoiser,
}

/// One reference unit.
#[derive(Debug, Clone)]
pub struct ReferenceUnit {
    role: Role,
    dims: ReferenceModelBuilder,
    params: UnitParams,
    training: bool,
}

impl ReferenceUnit {
    fn new(role: Role, dims: ReferenceModelBuilder, params: Vec<(String, Array)>) -> Self {
        Self {
            role,
            dims,
            params: params
                .into_iter()
                .map(|(k, v)| (Rc::from(k.as_str()), v))
                .collect(),
            training: false,
        }
    }
}

fn input<'a>(inputs: &[&'a Array], i: usize, role: &str) -> MlxResult<&'a Array> {
    inputs
        .get(i)
        .copied()
        .ok_or_else(|| Exception::custom(format!("{role}: missing input {i}")))
}

fn affine(x: &Array, w: &Array, b: Option<&Array>) -> MlxResult<Array> {
    let y = x.matmul(w)?;
    match b {
        Some(b) => y.add(b),
        None => Ok(y),
    }
}

/// Repeat every frame twice along the last axis: `[B, T] -> [B, 2T]`.
fn upsample2(x: &Array) -> MlxResult<Array> {
    let (b, t) = (x.dim(0), x.dim(1));
    broadcast_to(&x.reshape(&[b, t, 1])?, &[b, t, 2])?.reshape(&[b, 2 * t])
}

/// Split `[B, S]` into frames `[B, S / n, n]`, dropping the remainder.
fn frames(x: &Array, n: i32) -> MlxResult<Array> {
    let (b, len) = (x.dim(0), x.dim(-1));
    let count = len / n;
    if count == 0 {
        return Err(Exception::custom(format!(
            "signal of {len} samples is shorter than one frame of {n}"
        )));
    }
    x.reshape(&[b, len])?
        .index((.., ..count * n))
        .reshape(&[b, count, n])
}

impl ReferenceUnit {
    fn text_aligner(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let mels = input(inputs, 0, "text_aligner")?;
        let frame_mask = input(inputs, 1, "text_aligner")?;
        let texts = input(inputs, 2, "text_aligner")?;
        let (b, m) = (mels.dim(0), mels.dim(1));
        let stride = 1i32 << self.dims.n_down;
        let t_down = mels.dim(2) / stride;
        let t_mask = frame_mask.dim(1).min(t_down);

        let pooled = mels
            .index((.., .., ..t_mask * stride))
            .transpose_axes(&[0, 2, 1])?
            .reshape(&[b, t_mask, stride, m])?
            .mean_axis(2, None)?;
        let feats = tanh(&pooled.matmul(param(p, "frame_proj")?)?)?;

        let tokens = param(p, "embedding")?.take_axis(texts, 0)?;
        let h = tokens.dim(-1);
        let start = broadcast_to(&param(p, "start")?.reshape(&[1, 1, h])?, &[b, 1, h])?;
        let queries = concatenate_axis(&[start, tokens], 1)?;

        let scale = Array::from_f32(1.0 / (h as f32).sqrt());
        let penalty = frame_mask
            .index((.., ..t_mask))
            .reshape(&[b, 1, t_mask])?
            .multiply(&Array::from_f32(1e9))?;
        let scores = queries
            .matmul(&feats.transpose_axes(&[0, 2, 1])?)?
            .multiply(&scale)?
            .subtract(&penalty)?;
        let attn = softmax_axis(&scores, -1, None)?;

        let context = attn.matmul(&feats)?;
        let out = param(p, "out_proj")?;
        let s2s_pred = context.index((.., 1.., ..)).matmul(out)?;
        let ppgs = feats.matmul(out)?;
        Ok(vec![ppgs, s2s_pred, attn])
    }

    fn text_encoder(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let texts = input(inputs, 0, "text_encoder")?;
        let mask = input(inputs, 2, "text_encoder")?;
        let x = param(p, "embedding")?.take_axis(texts, 0)?;
        let h = tanh(&affine(&x, param(p, "proj.weight")?, Some(param(p, "proj.bias")?))?)?;
        let keep = Array::from_f32(1.0).subtract(mask)?.reshape(&[mask.dim(0), mask.dim(1), 1])?;
        Ok(vec![h.multiply(&keep)?.transpose_axes(&[0, 2, 1])?])
    }

    fn bert(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let texts = input(inputs, 0, "bert")?;
        let attention = input(inputs, 1, "bert")?;
        let x = param(p, "embedding")?.take_axis(texts, 0)?;
        let h = tanh(&affine(&x, param(p, "layer.weight")?, Some(param(p, "layer.bias")?))?)?;
        let keep = attention.reshape(&[attention.dim(0), attention.dim(1), 1])?;
        Ok(vec![h.multiply(&keep)?])
    }

    fn style_encoder(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let mel = input(inputs, 0, "style_encoder")?;
        let pooled = mel.squeeze_axes(&[1])?.mean_axis(-1, None)?;
        Ok(vec![tanh(&affine(
            &pooled,
            param(p, "proj.weight")?,
            Some(param(p, "proj.bias")?),
        )?)?])
    }

    fn predictor_hidden(&self, p: &UnitParams, d_en: &Array, style: &Array, mask: &Array) -> MlxResult<Array> {
        let x = d_en.transpose_axes(&[0, 2, 1])?;
        let (b, l) = (x.dim(0), x.dim(1));
        let s = style.dim(-1);
        let st = broadcast_to(&style.reshape(&[b, 1, s])?, &[b, l, s])?;
        let h = tanh(&affine(
            &concatenate_axis(&[x, st], -1)?,
            param(p, "lstm.weight")?,
            Some(param(p, "lstm.bias")?),
        )?)?;
        let keep = Array::from_f32(1.0).subtract(mask)?.reshape(&[b, l, 1])?;
        h.multiply(&keep)
    }

    fn predictor(&self, entry: Entry, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        match entry {
            Entry::Forward => {
                let d_en = input(inputs, 0, "predictor")?;
                let style = input(inputs, 1, "predictor")?;
                let alignment = input(inputs, 3, "predictor")?;
                let mask = input(inputs, 4, "predictor")?;
                let h = self.predictor_hidden(p, d_en, style, mask)?;
                let logits = affine(
                    &h,
                    param(p, "duration_proj.weight")?,
                    Some(param(p, "duration_proj.bias")?),
                )?;
                let expanded = h.transpose_axes(&[0, 2, 1])?.matmul(alignment)?;
                let prosody = tanh(&expanded.transpose_axes(&[0, 2, 1])?.matmul(param(p, "shared.weight")?)?)?
                    .transpose_axes(&[0, 2, 1])?;
                Ok(vec![logits, prosody])
            }
            Entry::Durations => {
                let d_en = input(inputs, 0, "predictor")?;
                let style = input(inputs, 1, "predictor")?;
                let mask = input(inputs, 3, "predictor")?;
                let h = self.predictor_hidden(p, d_en, style, mask)?;
                Ok(vec![affine(
                    &h,
                    param(p, "duration_proj.weight")?,
                    Some(param(p, "duration_proj.bias")?),
                )?])
            }
            Entry::F0N => {
                let p_en = input(inputs, 0, "predictor")?;
                let style = input(inputs, 1, "predictor")?;
                let x = p_en.transpose_axes(&[0, 2, 1])?;
                let (b, t) = (x.dim(0), x.dim(1));
                let curve = |proj: &str, st: &str| -> MlxResult<Array> {
                    let frame = x.matmul(param(p, proj)?)?.reshape(&[b, t])?;
                    let offset = style.matmul(param(p, st)?)?.reshape(&[b, 1])?;
                    upsample2(&frame.add(&offset)?)
                };
                Ok(vec![
                    curve("f0_proj.weight", "f0_style.weight")?,
                    curve("n_proj.weight", "n_style.weight")?,
                ])
            }
        }
    }

    fn pitch_extractor(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let mel = input(inputs, 0, "pitch_extractor")?.squeeze_axes(&[1])?;
        let (b, t) = (mel.dim(0), mel.dim(2));
        let f0 = mel.transpose_axes(&[0, 2, 1])?.matmul(param(p, "weight")?)?;
        Ok(vec![f0.reshape(&[b, t])?])
    }

    fn decoder(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let asr = input(inputs, 0, "decoder")?;
        let f0 = input(inputs, 1, "decoder")?;
        let n = input(inputs, 2, "decoder")?;
        let style = input(inputs, 3, "decoder")?;
        let (b, t) = (asr.dim(0), asr.dim(2));

        let content = asr.transpose_axes(&[0, 2, 1])?.matmul(param(p, "asr.weight")?)?.reshape(&[b, t])?;
        let content = upsample2(&content)?;
        let offset = style.matmul(param(p, "style.weight")?)?.reshape(&[b, 1])?;
        let envelope = tanh(
            &content
                .add(&f0.multiply(param(p, "f0.weight")?)?)?
                .add(&n.multiply(param(p, "n.weight")?)?)?
                .add(&offset)?
                .add(param(p, "bias")?)?,
        )?;

        let hop = self.dims.hop;
        let carrier: Vec<f32> = (0..hop)
            .map(|i| (std::f32::consts::TAU * i as f32 / hop as f32).sin() + 0.5)
            .collect();
        let carrier = Array::from_slice(&carrier, &[1, 1, hop]);
        let wave = envelope.reshape(&[b, 2 * t, 1])?.multiply(&carrier)?;
        Ok(vec![wave.reshape(&[b, 1, 2 * t * hop])?])
    }

    fn discriminator(&self, periods: &[i32], p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let wave = input(inputs, 0, "discriminator")?;
        let mut logits = Vec::with_capacity(periods.len());
        let mut features = Vec::with_capacity(periods.len());
        for (k, &period) in periods.iter().enumerate() {
            let x = frames(wave, period)?;
            let h = tanh(&affine(
                &x,
                param(p, &format!("head{k}.weight"))?,
                Some(param(p, &format!("head{k}.bias"))?),
            )?)?;
            let score = h.matmul(param(p, &format!("head{k}.out"))?)?.squeeze_axes(&[-1])?;
            logits.push(score);
            features.push(h);
        }
        logits.extend(features);
        Ok(logits)
    }

    fn speech_lm(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let wave = input(inputs, 0, "slm")?;
        let mut h = frames(wave, self.dims.slm_frame)?;
        let mut hidden = Vec::with_capacity(self.dims.slm_layers as usize);
        for l in 0..self.dims.slm_layers {
            h = tanh(&h.matmul(param(p, &format!("layer{l}.weight"))?)?)?;
            hidden.push(h.clone());
        }
        Ok(hidden)
    }

    fn frame_critic(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let x = input(inputs, 0, "wd")?.transpose_axes(&[0, 2, 1])?;
        let y = affine(&x, param(p, "weight")?, Some(param(p, "bias")?))?;
        Ok(vec![y.squeeze_axes(&[-1])?])
    }

    fn denoiser(&self, p: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        let x = input(inputs, 0, "diffusion")?;
        let c_noise = input(inputs, 1, "diffusion")?;
        let embedding = input(inputs, 2, "diffusion")?;
        let keep = input(inputs, 3, "diffusion")?;
        let b = x.dim(0);
        let width = x.dim(-1);

        let keep = keep.reshape(&[b, 1])?;
        let pooled = embedding.mean_axis(1, None)?;
        let fixed = param(p, "fixed_embedding")?;
        let emb = pooled
            .multiply(&keep)?
            .add(&fixed.multiply(&Array::from_f32(1.0).subtract(&keep)?)?)?;

        let flat = x.reshape(&[b, width])?;
        let mut h = flat
            .matmul(param(p, "x.weight")?)?
            .add(&emb.matmul(param(p, "embedding.weight")?)?)?
            .add(&c_noise.reshape(&[b, 1])?.multiply(param(p, "time.weight")?)?)?
            .add(param(p, "bias")?)?;
        if let Some(features) = inputs.get(4) {
            if features.shape() != [b, width] {
                return Err(Exception::custom(format!(
                    "diffusion: reference features must be [{b}, {width}], got {:?}",
                    features.shape()
                )));
            }
            h = h.add(&features.matmul(param(p, "features.weight")?)?)?;
        }
        let out = tanh(&h)?.matmul(param(p, "out.weight")?)?;
        Ok(vec![out.reshape(&[b, 1, width])?])
    }
}

impl TrainableUnit for ReferenceUnit {
    fn forward(&self, entry: Entry, params: &UnitParams, inputs: &[&Array]) -> MlxResult<Vec<Array>> {
        match &self.role {
            Role::TextAligner => self.text_aligner(params, inputs),
            Role::TextEncoder => self.text_encoder(params, inputs),
            Role::Bert => self.bert(params, inputs),
            Role::Linear => {
                let x = input(inputs, 0, "linear")?;
                Ok(vec![affine(x, param(params, "weight")?, Some(param(params, "bias")?))?])
            }
            Role::StyleEncoder => self.style_encoder(params, inputs),
            Role::Predictor => self.predictor(entry, params, inputs),
            Role::PitchExtractor => self.pitch_extractor(params, inputs),
            Role::Decoder => self.decoder(params, inputs),
            Role::Discriminator(periods) => self.discriminator(periods, params, inputs),
            Role::SpeechLm => self.speech_lm(params, inputs),
            Role::FrameCritic => self.frame_critic(params, inputs),
            Role::Denoiser => self.denoiser(params, inputs),
        }
    }

    fn parameters(&self) -> &UnitParams {
        &self.params
    }

    fn set_parameters(&mut self, params: UnitParams) {
        self.params = params;
    }

    fn train_mode(&mut self) {
        self.training = true;
    }

    fn eval_mode(&mut self) {
        self.training = false;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn boxed_clone(&self) -> Box<dyn TrainableUnit> {
        Box::new(self.clone())
    }

    fn num_heads(&self) -> usize {
        match &self.role {
            Role::Discriminator(periods) => periods.len(),
            _ => 1,
        }
    }

    fn frozen(&self) -> bool {
        self.role == Role::SpeechLm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::length_to_mask;

    fn shape_of(unit: &dyn TrainableUnit, entry: Entry, inputs: &[&Array]) -> Vec<Vec<i32>> {
        unit.apply(entry, inputs)
            .unwrap()
            .iter()
            .map(|a| a.shape().to_vec())
            .collect()
    }

    #[test]
    fn test_unit_shapes() {
        let dims = ReferenceModelBuilder::tiny();
        let registry = dims.build(3);
        let (b, l, t) = (2, 3, 12);
        let tp = t / 2;
        let texts = Array::from_slice(&[1i32, 2, 3, 4, 5, 0], &[b, l]);
        let mels = mlx_rs::ops::ones::<f32>(&[b, dims.n_mels, t]).unwrap();
        let frame_mask = length_to_mask(&[tp, tp - 1], tp);
        let text_mask = length_to_mask(&[3, 2], l);

        let aligner = shape_of(
            registry.get(names::TEXT_ALIGNER).unwrap(),
            Entry::Forward,
            &[&mels, &frame_mask, &texts],
        );
        assert_eq!(aligner[1], vec![b, l, dims.vocab]);
        assert_eq!(aligner[2], vec![b, l + 1, tp]);

        let d_en = mlx_rs::ops::ones::<f32>(&[b, dims.predictor_dim, l]).unwrap();
        let style = mlx_rs::ops::ones::<f32>(&[b, dims.style_dim]).unwrap();
        let lengths = Array::from_slice(&[3i32, 2], &[b]);
        let alignment = mlx_rs::ops::ones::<f32>(&[b, l, tp]).unwrap();
        let predictor = registry.get(names::PREDICTOR).unwrap();
        let out = shape_of(predictor, Entry::Forward, &[&d_en, &style, &lengths, &alignment, &text_mask]);
        assert_eq!(out[0], vec![b, l, dims.max_dur]);
        assert_eq!(out[1], vec![b, dims.channels, tp]);

        let p_en = mlx_rs::ops::ones::<f32>(&[b, dims.channels, tp]).unwrap();
        let f0n = shape_of(predictor, Entry::F0N, &[&p_en, &style]);
        assert_eq!(f0n[0], vec![b, 2 * tp]);

        let f0 = mlx_rs::ops::ones::<f32>(&[b, 2 * tp]).unwrap();
        let wave = shape_of(
            registry.get(names::DECODER).unwrap(),
            Entry::Forward,
            &[&p_en, &f0, &f0, &style],
        );
        assert_eq!(wave[0], vec![b, 1, 2 * tp * dims.hop]);

        let audio = mlx_rs::ops::ones::<f32>(&[b, 1, 2 * tp * dims.hop]).unwrap();
        let mpd = registry.get(names::MPD).unwrap();
        let outs = mpd.apply(Entry::Forward, &[&audio]).unwrap();
        assert_eq!(outs.len(), 2 * mpd.num_heads());
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = ReferenceModelBuilder::tiny().build(9);
        let b = ReferenceModelBuilder::tiny().build(9);
        let wa = &a.get(names::DECODER).unwrap().parameters()["asr.weight"];
        let wb = &b.get(names::DECODER).unwrap().parameters()["asr.weight"];
        let diff = wa.subtract(wb).unwrap().abs().unwrap().sum(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);
        assert!(a.get(names::SLM).unwrap().frozen());
    }
}
