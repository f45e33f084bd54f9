//! Configuration types for stylus.
//!
//! The layout mirrors the second-stage fine-tuning YAML. [`ConfigDocument`]
//! keeps the raw YAML next to the typed view so that values estimated during
//! training can be written back without dropping keys this crate ignores.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::{Result, StylusError};

/// Complete training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Directory for checkpoints, metrics and the re-dumped config.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Save a checkpoint every N epochs.
    #[serde(default = "default_save_freq")]
    pub save_freq: usize,

    /// Emit a metrics record every N steps.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    /// Number of epochs to train, counted from the resumed epoch.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Batch size used by the data loader.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum decoder clip length in mel frames.
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Seed for every random decision made by the trainer.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Second-stage checkpoint to resume from.
    #[serde(default)]
    pub pretrained_model: String,

    /// Whether `pretrained_model` should be loaded instead of the first stage.
    #[serde(default)]
    pub second_stage_load_pretrained: bool,

    /// Restore only unit weights from `pretrained_model`.
    #[serde(default = "default_true")]
    pub load_only_params: bool,

    /// First-stage checkpoint, relative to `log_dir`.
    #[serde(default)]
    pub first_stage_path: String,

    /// Audio preprocessing parameters.
    #[serde(default)]
    pub preprocess_params: PreprocessParams,

    /// Model-level parameters the trainer reads.
    #[serde(default)]
    pub model_params: ModelParams,

    /// Loss weights and curriculum thresholds.
    #[serde(default)]
    pub loss_params: LossParams,

    /// Optimizer learning rates.
    #[serde(default)]
    pub optimizer_params: OptimizerParams,

    /// Speech-LM adversarial stage parameters.
    #[serde(default)]
    pub slmadv_params: SlmAdvParams,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            save_freq: default_save_freq(),
            log_interval: default_log_interval(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            max_len: default_max_len(),
            seed: default_seed(),
            pretrained_model: String::new(),
            second_stage_load_pretrained: false,
            load_only_params: true,
            first_stage_path: String::new(),
            preprocess_params: PreprocessParams::default(),
            model_params: ModelParams::default(),
            loss_params: LossParams::default(),
            optimizer_params: OptimizerParams::default(),
            slmadv_params: SlmAdvParams::default(),
        }
    }
}

impl TrainConfig {
    /// Parse a configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read a configuration file without validating it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    /// Serialize to YAML text.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Whether a second-stage checkpoint should be resumed.
    pub fn resumes_second_stage(&self) -> bool {
        !self.pretrained_model.is_empty() && self.second_stage_load_pretrained
    }

    /// Audio samples covered by one mel frame.
    pub fn hop_length(&self) -> usize {
        self.preprocess_params.spect_params.hop_length
    }

    /// Validate value ranges.
    ///
    /// `diff_epoch <= joint_epoch` is assumed by the curriculum but not
    /// enforced; a violation only produces a warning.
    pub fn validate(&self) -> Result<()> {
        if self.save_freq == 0 {
            return Err(StylusError::Config("save_freq must be positive".into()));
        }
        if self.log_interval == 0 {
            return Err(StylusError::Config("log_interval must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(StylusError::Config("batch_size must be positive".into()));
        }
        if self.preprocess_params.spect_params.hop_length == 0 {
            return Err(StylusError::Config("hop_length must be positive".into()));
        }
        if self.model_params.style_dim == 0 {
            return Err(StylusError::Config("style_dim must be positive".into()));
        }
        for (name, value) in self.loss_params.weights.iter() {
            if !value.is_finite() || value < 0.0 {
                return Err(StylusError::Config(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
        }

        let slm = &self.slmadv_params;
        if !(slm.batch_percentage > 0.0 && slm.batch_percentage <= 1.0) {
            return Err(StylusError::Config(format!(
                "slmadv_params.batch_percentage must be in (0, 1], got {}",
                slm.batch_percentage
            )));
        }
        if slm.iter == 0 {
            return Err(StylusError::Config("slmadv_params.iter must be positive".into()));
        }
        if slm.sig <= 0.0 {
            return Err(StylusError::Config("slmadv_params.sig must be positive".into()));
        }
        if slm.min_len > slm.max_len {
            return Err(StylusError::Config(format!(
                "slmadv_params.min_len ({}) exceeds max_len ({})",
                slm.min_len, slm.max_len
            )));
        }
        if !(0.0..=1.0).contains(&slm.skip_probability) {
            return Err(StylusError::Config(
                "slmadv_params.skip_probability must be in [0, 1]".into(),
            ));
        }

        if self.loss_params.diff_epoch > self.loss_params.joint_epoch {
            tracing::warn!(
                diff_epoch = self.loss_params.diff_epoch,
                joint_epoch = self.loss_params.joint_epoch,
                "joint_epoch precedes diff_epoch; the adversarial stage will sample from an untrained style sampler"
            );
        }

        Ok(())
    }
}

/// Audio preprocessing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessParams {
    /// Training sample rate.
    #[serde(default = "default_sr")]
    pub sr: u32,
    /// Spectrogram parameters.
    #[serde(default)]
    pub spect_params: SpectParams,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            sr: default_sr(),
            spect_params: SpectParams::default(),
        }
    }
}

/// Spectrogram parameters of the mel front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectParams {
    /// FFT size.
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    /// Window length.
    #[serde(default = "default_win_length")]
    pub win_length: usize,
    /// Hop length, also the number of samples per mel frame.
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
}

impl Default for SpectParams {
    fn default() -> Self {
        Self {
            n_fft: default_n_fft(),
            win_length: default_win_length(),
            hop_length: default_hop_length(),
        }
    }
}

/// Model parameters consumed by the trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Whether reference styles condition the style sampler.
    #[serde(default)]
    pub multispeaker: bool,
    /// Aligner time downsampling exponent (stride `2^n_down`).
    #[serde(default = "default_n_down")]
    pub n_down: u32,
    /// Width of each of the acoustic and prosodic style halves.
    #[serde(default = "default_style_dim")]
    pub style_dim: usize,
    /// Number of mel bins.
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,
    /// Style diffusion parameters.
    #[serde(default)]
    pub diffusion: DiffusionParams,
    /// Speech language model parameters.
    #[serde(default)]
    pub slm: SlmParams,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            multispeaker: false,
            n_down: default_n_down(),
            style_dim: default_style_dim(),
            n_mels: default_n_mels(),
            diffusion: DiffusionParams::default(),
            slm: SlmParams::default(),
        }
    }
}

/// Style diffusion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionParams {
    /// Probability of replacing the text embedding while sampling.
    #[serde(default = "default_embedding_mask_proba")]
    pub embedding_mask_proba: f32,
    /// Noise distribution parameters.
    #[serde(default)]
    pub dist: DistParams,
}

impl Default for DiffusionParams {
    fn default() -> Self {
        Self {
            embedding_mask_proba: default_embedding_mask_proba(),
            dist: DistParams::default(),
        }
    }
}

/// Noise distribution of the style diffusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistParams {
    /// Data standard deviation used for preconditioning.
    #[serde(default = "default_sigma_data")]
    pub sigma_data: f32,
    /// Re-estimate `sigma_data` from each batch and persist the running mean.
    #[serde(default = "default_true")]
    pub estimate_sigma_data: bool,
    /// Mean of the log-normal training sigma distribution.
    #[serde(default = "default_dist_mean")]
    pub mean: f32,
    /// Standard deviation of the log-normal training sigma distribution.
    #[serde(default = "default_dist_std")]
    pub std: f32,
}

impl Default for DistParams {
    fn default() -> Self {
        Self {
            sigma_data: default_sigma_data(),
            estimate_sigma_data: true,
            mean: default_dist_mean(),
            std: default_dist_std(),
        }
    }
}

/// Speech language model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlmParams {
    /// Model identifier of the frozen speech language model.
    #[serde(default = "default_slm_model")]
    pub model: String,
    /// Sample rate expected by the speech language model.
    #[serde(default = "default_slm_sr")]
    pub sr: u32,
}

impl Default for SlmParams {
    fn default() -> Self {
        Self {
            model: default_slm_model(),
            sr: default_slm_sr(),
        }
    }
}

/// Linear coefficients of the generator objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    /// Multi-resolution STFT reconstruction.
    #[serde(default = "default_lambda_mel")]
    pub lambda_mel: f32,
    /// Waveform adversarial loss.
    #[serde(default = "default_one")]
    pub lambda_gen: f32,
    /// Speech-LM feature loss.
    #[serde(default = "default_one")]
    pub lambda_slm: f32,
    /// Alignment consistency.
    #[serde(default = "default_one")]
    pub lambda_mono: f32,
    /// Phoneme recognition.
    #[serde(default = "default_one")]
    pub lambda_s2s: f32,
    /// Pitch reconstruction.
    #[serde(rename = "lambda_F0", default = "default_one")]
    pub lambda_f0: f32,
    /// Energy reconstruction.
    #[serde(default = "default_one")]
    pub lambda_norm: f32,
    /// Duration regression.
    #[serde(default = "default_one")]
    pub lambda_dur: f32,
    /// Duration binary cross-entropy.
    #[serde(default = "default_lambda_ce")]
    pub lambda_ce: f32,
    /// Style reconstruction.
    #[serde(default = "default_one")]
    pub lambda_sty: f32,
    /// Denoising loss.
    #[serde(default = "default_one")]
    pub lambda_diff: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            lambda_mel: default_lambda_mel(),
            lambda_gen: 1.0,
            lambda_slm: 1.0,
            lambda_mono: 1.0,
            lambda_s2s: 1.0,
            lambda_f0: 1.0,
            lambda_norm: 1.0,
            lambda_dur: 1.0,
            lambda_ce: default_lambda_ce(),
            lambda_sty: 1.0,
            lambda_diff: 1.0,
        }
    }
}

impl LossWeights {
    /// Iterate `(name, weight)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f32)> {
        [
            ("lambda_mel", self.lambda_mel),
            ("lambda_gen", self.lambda_gen),
            ("lambda_slm", self.lambda_slm),
            ("lambda_mono", self.lambda_mono),
            ("lambda_s2s", self.lambda_s2s),
            ("lambda_F0", self.lambda_f0),
            ("lambda_norm", self.lambda_norm),
            ("lambda_dur", self.lambda_dur),
            ("lambda_ce", self.lambda_ce),
            ("lambda_sty", self.lambda_sty),
            ("lambda_diff", self.lambda_diff),
        ]
        .into_iter()
    }
}

/// Loss weights plus the epochs at which optional objectives start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossParams {
    /// Loss weights.
    #[serde(flatten)]
    pub weights: LossWeights,
    /// First epoch with the style diffusion objectives.
    #[serde(default = "default_diff_epoch")]
    pub diff_epoch: usize,
    /// First epoch with the speech-LM adversarial stage.
    #[serde(default = "default_joint_epoch")]
    pub joint_epoch: usize,
}

impl Default for LossParams {
    fn default() -> Self {
        Self {
            weights: LossWeights::default(),
            diff_epoch: default_diff_epoch(),
            joint_epoch: default_joint_epoch(),
        }
    }
}

/// Learning rates of the per-unit optimizers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerParams {
    /// Default learning rate.
    #[serde(default = "default_lr")]
    pub lr: f32,
    /// Learning rate of the text language model.
    #[serde(default = "default_bert_lr")]
    pub bert_lr: f32,
    /// Learning rate of the acoustic units (decoder, style encoder).
    #[serde(default = "default_lr")]
    pub ft_lr: f32,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            bert_lr: default_bert_lr(),
            ft_lr: default_lr(),
        }
    }
}

/// Speech-LM adversarial stage parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlmAdvParams {
    /// Minimum generated length in mel frames.
    #[serde(default = "default_slm_min_len")]
    pub min_len: usize,
    /// Maximum generated length in mel frames.
    #[serde(default = "default_slm_max_len")]
    pub max_len: usize,
    /// Fraction of the batch that is decoded.
    #[serde(default = "default_batch_percentage")]
    pub batch_percentage: f32,
    /// Update the critic every N iterations.
    #[serde(default = "default_slm_iter")]
    pub iter: usize,
    /// Predictor gradient norm above which all gradients are rescaled.
    #[serde(default = "default_thresh")]
    pub thresh: f32,
    /// Factor applied to duration and diffusion gradients.
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Width of the Gaussian duration upsampling kernel.
    #[serde(default = "default_sig")]
    pub sig: f32,
    /// Probability of skipping the stage for a step.
    #[serde(default)]
    pub skip_probability: f32,
}

impl Default for SlmAdvParams {
    fn default() -> Self {
        Self {
            min_len: default_slm_min_len(),
            max_len: default_slm_max_len(),
            batch_percentage: default_batch_percentage(),
            iter: default_slm_iter(),
            thresh: default_thresh(),
            scale: default_scale(),
            sig: default_sig(),
            skip_probability: 0.0,
        }
    }
}

/// A parsed configuration together with its raw YAML document.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    /// Raw document, written back on save.
    raw: Value,
    /// Typed view.
    pub config: TrainConfig,
}

impl ConfigDocument {
    /// Parse YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(yaml)?;
        let raw = if raw.is_null() {
            Value::Mapping(Mapping::new())
        } else {
            raw
        };
        let config: TrainConfig = serde_yaml::from_value(raw.clone())?;
        Ok(Self { raw, config })
    }

    /// Load and validate a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            StylusError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let doc = Self::from_yaml(&text)?;
        doc.config.validate()?;
        Ok(doc)
    }

    /// Record a new `sigma_data` in both views.
    pub fn set_sigma_data(&mut self, sigma_data: f32) -> Result<()> {
        self.set_value(
            &["model_params", "diffusion", "dist", "sigma_data"],
            f64::from(sigma_data),
        )
    }

    /// Set a nested key in the raw document and re-parse the typed view.
    ///
    /// Missing intermediate mappings are created. On error neither view changes.
    pub fn set_value<V: Serialize>(&mut self, path: &[&str], value: V) -> Result<()> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| StylusError::Config("empty config key path".into()))?;

        let mut raw = self.raw.clone();
        let mut node = raw
            .as_mapping_mut()
            .ok_or_else(|| StylusError::Config("config root is not a mapping".into()))?;
        for key in parents {
            if !node.contains_key(*key) {
                node.insert(Value::from(*key), Value::Mapping(Mapping::new()));
            }
            node = node
                .get_mut(*key)
                .and_then(Value::as_mapping_mut)
                .ok_or_else(|| StylusError::Config(format!("config key {key} is not a mapping")))?;
        }
        node.insert(Value::from(*last), serde_yaml::to_value(value)?);

        let config: TrainConfig = serde_yaml::from_value(raw.clone())?;
        self.raw = raw;
        self.config = config;
        Ok(())
    }

    /// Write the raw document.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_yaml::to_string(&self.raw)?)?;
        Ok(())
    }
}

fn default_log_dir() -> String {
    "./logs".to_string()
}
fn default_save_freq() -> usize {
    2
}
fn default_log_interval() -> usize {
    10
}
fn default_epochs() -> usize {
    200
}
fn default_batch_size() -> usize {
    10
}
fn default_max_len() -> usize {
    200
}
fn default_seed() -> u64 {
    42
}
fn default_true() -> bool {
    true
}
fn default_sr() -> u32 {
    24000
}
fn default_n_fft() -> usize {
    2048
}
fn default_win_length() -> usize {
    1200
}
fn default_hop_length() -> usize {
    300
}
fn default_n_down() -> u32 {
    1
}
fn default_style_dim() -> usize {
    128
}
fn default_n_mels() -> usize {
    80
}
fn default_embedding_mask_proba() -> f32 {
    0.1
}
fn default_sigma_data() -> f32 {
    0.2
}
fn default_dist_mean() -> f32 {
    -3.0
}
fn default_dist_std() -> f32 {
    1.0
}
fn default_slm_model() -> String {
    "microsoft/wavlm-base-plus".to_string()
}
fn default_slm_sr() -> u32 {
    16000
}
fn default_one() -> f32 {
    1.0
}
fn default_lambda_mel() -> f32 {
    5.0
}
fn default_lambda_ce() -> f32 {
    20.0
}
fn default_diff_epoch() -> usize {
    10
}
fn default_joint_epoch() -> usize {
    30
}
fn default_lr() -> f32 {
    1e-4
}
fn default_bert_lr() -> f32 {
    1e-5
}
fn default_slm_min_len() -> usize {
    400
}
fn default_slm_max_len() -> usize {
    500
}
fn default_batch_percentage() -> f32 {
    0.5
}
fn default_slm_iter() -> usize {
    10
}
fn default_thresh() -> f32 {
    5.0
}
fn default_scale() -> f32 {
    0.01
}
fn default_sig() -> f32 {
    1.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
log_dir: Models/Finetune
save_freq: 1
epochs: 50
batch_size: 2
max_len: 400
first_stage_path: first_stage.pth
data_params:
  train_data: Data/train_list.txt
model_params:
  multispeaker: true
  diffusion:
    dist:
      sigma_data: 0.2
      estimate_sigma_data: true
loss_params:
  lambda_mel: 5.
  lambda_F0: 1.
  lambda_ce: 20.
  diff_epoch: 10
  joint_epoch: 30
slmadv_params:
  min_len: 400
  max_len: 500
  thresh: 5
  scale: 0.01
  sig: 1.5
"#;

    #[test]
    fn test_parse_sample() {
        let doc = ConfigDocument::from_yaml(SAMPLE).unwrap();
        let cfg = &doc.config;
        assert_eq!(cfg.epochs, 50);
        assert!(cfg.model_params.multispeaker);
        assert_eq!(cfg.loss_params.diff_epoch, 10);
        assert!((cfg.loss_params.weights.lambda_ce - 20.0).abs() < 1e-6);
        assert!((cfg.loss_params.weights.lambda_f0 - 1.0).abs() < 1e-6);
        assert_eq!(cfg.hop_length(), 300);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_defaults_validate() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_batch_percentage() {
        let mut cfg = TrainConfig::default();
        cfg.slmadv_params.batch_percentage = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_diff_after_joint_is_not_fatal() {
        let mut cfg = TrainConfig::default();
        cfg.loss_params.diff_epoch = 40;
        cfg.loss_params.joint_epoch = 30;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sigma_written_back_preserving_unknown_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yml");

        let mut doc = ConfigDocument::from_yaml(SAMPLE).unwrap();
        doc.set_sigma_data(0.35).unwrap();
        doc.write(&path).unwrap();

        let reloaded = ConfigDocument::load(&path).unwrap();
        assert!((reloaded.config.model_params.diffusion.dist.sigma_data - 0.35).abs() < 1e-6);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("train_data"));
    }

    #[test]
    fn test_sigma_created_when_missing() {
        let mut doc = ConfigDocument::from_yaml("epochs: 3\n").unwrap();
        doc.set_sigma_data(0.5).unwrap();
        assert!((doc.config.model_params.diffusion.dist.sigma_data - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_set_value_updates_both_views() {
        let mut doc = ConfigDocument::from_yaml("").unwrap();
        doc.set_value(&["loss_params", "joint_epoch"], 4usize).unwrap();
        doc.set_value(&["log_dir"], "runs/a").unwrap();
        assert_eq!(doc.config.loss_params.joint_epoch, 4);
        assert_eq!(doc.config.log_dir, "runs/a");

        // A type mismatch leaves the document untouched.
        assert!(doc.set_value(&["epochs"], "many").is_err());
        assert_eq!(doc.config.log_dir, "runs/a");
        assert!(doc.set_value(&[], 1).is_err());
    }
}
