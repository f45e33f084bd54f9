//! The curriculum training loop.
//!
//! One [`CurriculumOrchestrator`] owns the model registry, the per-unit
//! optimizers, the style sampler and the adversarial stage, and drives them
//! through the epoch-gated curriculum:
//!
//! 1. every step runs the forward stage, a discriminator step and one
//!    generator step over the weighted objective;
//! 2. from `diff_epoch` on, the style diffusion objectives join the
//!    generator objective and the denoiser is stepped;
//! 3. from `joint_epoch` on, the speech-LM adversarial stage follows every
//!    generator step.
//!
//! Degenerate batches are skipped without touching any optimizer and are
//! counted in [`TrainingState::skipped_batches`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stylus_audio::loss::MultiResolutionStftLoss;
use stylus_core::{
    ConfigDocument, CurriculumThresholds, EvalMetrics, MetricsSink, StylusError, TrainConfig,
    TrainingState,
};
use tracing::{debug, info, warn};

use crate::adversarial::{AdversarialInputs, AdversarialStage};
use crate::checkpoint::{CheckpointManager, CheckpointMetadata, LoadOptions};
use crate::data::{Batch, BatchLoader};
use crate::forward::{validation_losses, ForwardConfig, ForwardStage, SkipReason, StepLosses};
use crate::multi_optimizer::MultiOptimizer;
use crate::registry::{names, ModelRegistry};
use crate::slm::SpeechLmCritic;
use crate::style_sampler::StyleSampler;
use crate::Result;

/// Units kept in eval mode while training. Everything else trains.
pub const EVAL_DURING_TRAINING: [&str; 7] = [
    names::PITCH_EXTRACTOR,
    names::PREDICTOR_ENCODER,
    names::STYLE_ENCODER,
    names::DECODER,
    names::DIFFUSION,
    names::SLM,
    names::WD,
];

/// Where the starting weights came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Startup {
    /// A second-stage checkpoint was resumed.
    SecondStage {
        /// Checkpoint directory.
        path: PathBuf,
        /// First epoch to run.
        start_epoch: usize,
    },
    /// A first-stage checkpoint was loaded and the curriculum offset.
    FirstStage {
        /// Checkpoint directory.
        path: PathBuf,
        /// Epoch the first stage ended on.
        start_epoch: usize,
    },
}

/// Result of one training step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The batch was trained on.
    Trained(StepReport),
    /// The batch was rejected before any update.
    Skipped(SkipReason),
}

/// Losses of a trained step.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    /// Main objective terms; `disc` is the waveform discriminator loss.
    pub losses: StepLosses,
    /// Speech-LM critic loss.
    pub d_loss_slm: f32,
    /// Speech-LM generator loss.
    pub gen_loss_slm: f32,
    /// Whether the adversarial stage was invoked.
    pub adversarial_invoked: bool,
    /// Whether the adversarial stage applied an update.
    pub adversarial_applied: bool,
}

/// Counters of one training epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochSummary {
    /// Batches trained on.
    pub trained: usize,
    /// Batches skipped.
    pub skipped: usize,
    /// Steps that invoked the adversarial stage.
    pub adversarial_invoked: usize,
    /// Steps where the adversarial stage applied an update.
    pub adversarial_applied: usize,
}

/// Drives the second-stage curriculum.
pub struct CurriculumOrchestrator<S: MetricsSink> {
    document: ConfigDocument,
    config_name: String,
    forward: ForwardConfig,
    thresholds: CurriculumThresholds,
    state: TrainingState,
    registry: ModelRegistry,
    optimizer: MultiOptimizer,
    sampler: StyleSampler,
    critic: SpeechLmCritic,
    adversarial: AdversarialStage,
    stft: MultiResolutionStftLoss,
    checkpoints: CheckpointManager,
    sink: S,
    rng: StdRng,
    steps_per_epoch: usize,
}

impl<S: MetricsSink> CurriculumOrchestrator<S> {
    /// Build the orchestrator around a complete registry.
    ///
    /// Nothing is loaded here; call [`Self::load_initial`] before
    /// [`Self::run`] to start from a checkpoint.
    pub fn new(
        document: ConfigDocument,
        registry: ModelRegistry,
        steps_per_epoch: usize,
        sink: S,
    ) -> Result<Self> {
        let config = &document.config;
        config.validate()?;

        let missing = registry.missing_roles();
        if !missing.is_empty() {
            return Err(StylusError::Config(format!(
                "model registry is missing units: {}",
                missing.join(", ")
            ))
            .into());
        }

        let optimizer = MultiOptimizer::from_config(
            &registry.trainable_names(),
            &config.optimizer_params,
            config.epochs,
            steps_per_epoch.max(1),
        )?;
        let diffusion = &config.model_params.diffusion;
        let sampler = StyleSampler::new(&diffusion.dist, diffusion.embedding_mask_proba);
        let critic = SpeechLmCritic::new(config.preprocess_params.sr, config.model_params.slm.sr);
        let forward = ForwardConfig::from_config(config);
        let adversarial = AdversarialStage::new(
            config.slmadv_params.clone(),
            critic,
            forward.hop,
            forward.style_dim,
        );
        let stft = MultiResolutionStftLoss::new(config.preprocess_params.sr as i32);
        let thresholds = CurriculumThresholds::from_config(&config.loss_params, config.epochs);
        let checkpoints = CheckpointManager::new(&config.log_dir)?;
        let rng = StdRng::seed_from_u64(config.seed);

        info!(
            units = registry.len(),
            trainable = registry.trainable_names().len(),
            diff_epoch = thresholds.diff_epoch,
            joint_epoch = thresholds.joint_epoch,
            epochs = thresholds.epochs,
            "Orchestrator ready"
        );

        Ok(Self {
            document,
            config_name: "config.yml".to_string(),
            forward,
            thresholds,
            state: TrainingState::default(),
            registry,
            optimizer,
            sampler,
            critic,
            adversarial,
            stft,
            checkpoints,
            sink,
            rng,
            steps_per_epoch,
        })
    }

    /// Replace the reconstruction loss (e.g. smaller resolutions for short clips).
    pub fn with_stft_loss(mut self, stft: MultiResolutionStftLoss) -> Self {
        self.stft = stft;
        self
    }

    /// File name of the re-dumped configuration.
    pub fn with_config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = name.into();
        self
    }

    /// Typed configuration.
    pub fn config(&self) -> &TrainConfig {
        &self.document.config
    }

    /// Curriculum thresholds in effect.
    pub fn thresholds(&self) -> CurriculumThresholds {
        self.thresholds
    }

    /// Training progress.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Model units.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Per-unit optimizers.
    pub fn optimizer(&self) -> &MultiOptimizer {
        &self.optimizer
    }

    /// Style sampler.
    pub fn sampler(&self) -> &StyleSampler {
        &self.sampler
    }

    /// Checkpoint manager rooted at `log_dir`.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Metrics sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Consume the orchestrator and return its sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Load starting weights.
    ///
    /// With `pretrained_model` and `second_stage_load_pretrained` set, a
    /// second-stage checkpoint is resumed (optimizer state, epoch and
    /// iteration too unless `load_only_params`). Otherwise the first-stage
    /// checkpoint at `log_dir/first_stage_path` is loaded params-only without
    /// the units the second stage trains from scratch, every threshold is
    /// shifted by its epoch and `predictor_encoder` becomes a copy of
    /// `style_encoder`.
    pub fn load_initial(&mut self) -> Result<Startup> {
        let config = self.document.config.clone();

        if config.resumes_second_stage() {
            let path = PathBuf::from(&config.pretrained_model);
            let options = if config.load_only_params {
                LoadOptions::params_only()
            } else {
                LoadOptions::full()
            };
            let loaded = CheckpointManager::load(
                &path,
                &mut self.registry,
                Some(&mut self.optimizer),
                &options,
            )?;

            let mut start_epoch = 0;
            if !config.load_only_params {
                let meta = &loaded.metadata;
                start_epoch = meta.epoch + 1;
                self.state = TrainingState {
                    best_validation_loss: meta.best_val_loss.unwrap_or(f64::INFINITY),
                    skipped_batches: meta.skipped_batches,
                    ..TrainingState::resumed(start_epoch, meta.iters)
                };
                if let Some(sigma) = meta.sigma_data {
                    self.sampler.set_sigma_data(sigma);
                }
            }
            info!(
                path = %path.display(),
                start_epoch,
                iteration = self.state.iteration,
                "Resumed second stage"
            );
            return Ok(Startup::SecondStage { path, start_epoch });
        }

        if config.first_stage_path.is_empty() {
            return Err(StylusError::Config(
                "You need to specify the path to the first stage model.".into(),
            )
            .into());
        }
        let path = Path::new(&config.log_dir).join(&config.first_stage_path);
        if !path.exists() {
            return Err(StylusError::Config(format!(
                "first stage checkpoint not found at {}",
                path.display()
            ))
            .into());
        }

        let options = LoadOptions::params_only().ignoring(&names::FIRST_STAGE_IGNORED);
        let loaded = CheckpointManager::load(&path, &mut self.registry, None, &options)?;
        let start_epoch = loaded.metadata.epoch;

        self.thresholds = self.thresholds.offset_by(start_epoch);
        self.state = TrainingState::resumed(start_epoch, 0);
        self.registry
            .copy_unit(names::STYLE_ENCODER, names::PREDICTOR_ENCODER)?;

        info!(
            path = %path.display(),
            start_epoch,
            diff_epoch = self.thresholds.diff_epoch,
            joint_epoch = self.thresholds.joint_epoch,
            "Loaded first stage"
        );
        Ok(Startup::FirstStage { path, start_epoch })
    }

    /// Train from the current epoch to the end of the curriculum.
    pub fn run(
        &mut self,
        train_loader: &mut dyn BatchLoader,
        val_loader: &mut dyn BatchLoader,
    ) -> Result<TrainingState> {
        let start = self.state.epoch;
        let save_freq = self.document.config.save_freq.max(1);
        let config_path = self.checkpoints.save_config(&self.document, &self.config_name)?;
        debug!(path = %config_path.display(), "config copied to log_dir");
        info!(
            start_epoch = start,
            epochs = self.thresholds.epochs,
            batches = train_loader.num_batches(),
            "Starting training"
        );

        for epoch in start..self.thresholds.epochs {
            self.state.epoch = epoch;
            train_loader.reset(Some(self.document.config.seed.wrapping_add(epoch as u64 + 1)));

            let summary = self.train_epoch(epoch, train_loader)?;
            let metrics = self.validate(epoch, val_loader)?;
            debug!(epoch, ?summary, "epoch complete");

            if (epoch + 1) % save_freq == 0 {
                self.save(epoch, &metrics)?;
            }
        }

        self.state.epoch = self.thresholds.epochs.max(start);
        self.sink.flush()?;
        info!(
            iterations = self.state.iteration,
            skipped = self.state.skipped_batches,
            best_val_loss = self.state.best_validation_loss,
            "Training complete"
        );
        Ok(self.state.clone())
    }

    /// Run one epoch over `loader` (which must already be reset).
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        loader: &mut dyn BatchLoader,
    ) -> Result<EpochSummary> {
        self.registry.train_mode_except(&EVAL_DURING_TRAINING);
        let log_interval = self.document.config.log_interval.max(1);
        let num_batches = loader.num_batches();
        let started = Instant::now();

        let mut summary = EpochSummary::default();
        let mut running_loss = 0.0f64;
        let mut index = 0usize;
        while let Some(batch) = loader.next_batch() {
            batch.validate()?;
            match self.train_step(epoch, index, &batch)? {
                StepOutcome::Skipped(reason) => {
                    summary.skipped += 1;
                    debug!(epoch, step = index, %reason, "batch skipped");
                }
                StepOutcome::Trained(report) => {
                    summary.trained += 1;
                    summary.adversarial_invoked += usize::from(report.adversarial_invoked);
                    summary.adversarial_applied += usize::from(report.adversarial_applied);
                    running_loss += f64::from(report.losses.mel);

                    if (index + 1) % log_interval == 0 {
                        let mel = running_loss / log_interval as f64;
                        self.log_step(epoch, index, num_batches, mel, &report)?;
                        running_loss = 0.0;
                        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "time elapsed");
                    }
                }
            }
            index += 1;
        }

        self.sink.add_scalar(
            "train/skipped_batches",
            summary.skipped as f64,
            self.state.iteration,
        )?;
        if summary.skipped > 0 {
            info!(
                epoch,
                skipped = summary.skipped,
                trained = summary.trained,
                "Skipped batches this epoch"
            );
        }
        Ok(summary)
    }

    /// One training step on `batch`, the `index`-th of its epoch.
    ///
    /// A skipped step changes nothing but the RNG position and the skip
    /// counter.
    pub fn train_step(
        &mut self,
        epoch: usize,
        index: usize,
        batch: &Batch,
    ) -> Result<StepOutcome> {
        let diffusion_active = self.thresholds.diffusion_active(epoch);
        let stage = match ForwardStage::prepare(
            &self.forward,
            &self.registry,
            &self.sampler,
            batch,
            diffusion_active,
            &mut self.rng,
        ) {
            Ok(stage) => stage,
            Err(reason) => {
                self.state.skipped_batches += 1;
                return Ok(StepOutcome::Skipped(reason));
            }
        };

        if let Some(sigma) = stage.sigma_estimate() {
            self.sampler.set_sigma_data(sigma);
            self.state.running_sigma_estimates.push(sigma);
        }

        let disc = stage.discriminator_step(&mut self.registry, &mut self.optimizer)?;
        let mut losses = stage.generator_step(
            &mut self.registry,
            &mut self.optimizer,
            &self.sampler,
            &self.stft,
            &self.critic,
        )?;
        losses.disc = disc;

        let mut report = StepReport {
            losses,
            ..StepReport::default()
        };

        if self.thresholds.adversarial_active(epoch) {
            let use_ind = self.rng.gen_bool(0.5);
            let (ref_texts, ref_lengths) = if use_ind {
                (&batch.texts, batch.input_lengths.as_slice())
            } else {
                (&batch.ref_texts, batch.ref_lengths.as_slice())
            };
            let inputs = AdversarialInputs {
                step: index,
                y_rec_gt: stage.ground_truth_wave(),
                y_rec_gt_pred: stage.reconstruction_from_truth(),
                waves: &batch.waves,
                mel_lengths: &batch.mel_lengths,
                ref_texts,
                ref_lengths,
                use_ind,
                s_trg: stage.target_styles(),
                ref_style: stage.reference_styles(),
            };
            report.adversarial_invoked = true;
            if let Some(outcome) = self.adversarial.run(
                &mut self.registry,
                &mut self.optimizer,
                &self.sampler,
                &inputs,
                &mut self.rng,
            )? {
                report.adversarial_applied = true;
                report.d_loss_slm = outcome.d_loss;
                report.gen_loss_slm = outcome.gen_loss;
            }
        }

        self.state.iteration += 1;
        Ok(StepOutcome::Trained(report))
    }

    fn log_step(
        &mut self,
        epoch: usize,
        index: usize,
        num_batches: usize,
        running_mel: f64,
        report: &StepReport,
    ) -> Result<()> {
        let l = &report.losses;
        let line = format!(
            "Epoch [{}/{}], Step [{}/{}], Loss: {:.5}, Disc Loss: {:.5}, Dur Loss: {:.5}, CE Loss: {:.5}, Norm Loss: {:.5}, F0 Loss: {:.5}, LM Loss: {:.5}, Gen Loss: {:.5}, Sty Loss: {:.5}, Diff Loss: {:.5}, DiscLM Loss: {:.5}, GenLM Loss: {:.5}, S2S Loss: {:.5}, Mono Loss: {:.5}",
            epoch + 1,
            self.thresholds.epochs,
            index + 1,
            num_batches,
            running_mel,
            l.disc,
            l.dur,
            l.ce,
            l.norm,
            l.f0,
            l.lm,
            l.gen,
            l.sty,
            l.diff,
            report.d_loss_slm,
            report.gen_loss_slm,
            l.s2s,
            l.mono,
        );
        self.sink.log_line(&line)?;

        let step = self.state.iteration;
        let scalars = [
            ("train/mel_loss", running_mel),
            ("train/gen_loss", f64::from(l.gen)),
            ("train/d_loss", f64::from(l.disc)),
            ("train/ce_loss", f64::from(l.ce)),
            ("train/dur_loss", f64::from(l.dur)),
            ("train/slm_loss", f64::from(l.lm)),
            ("train/norm_loss", f64::from(l.norm)),
            ("train/F0_loss", f64::from(l.f0)),
            ("train/sty_loss", f64::from(l.sty)),
            ("train/diff_loss", f64::from(l.diff)),
            ("train/d_loss_slm", f64::from(report.d_loss_slm)),
            ("train/gen_loss_slm", f64::from(report.gen_loss_slm)),
        ];
        for (tag, value) in scalars {
            self.sink.add_scalar(tag, value, step)?;
        }
        Ok(())
    }

    /// Mean validation losses over `loader`, written under `eval/*` at
    /// `epoch + 1`. Batches whose forward fails are skipped.
    pub fn validate(&mut self, epoch: usize, loader: &mut dyn BatchLoader) -> Result<EvalMetrics> {
        self.registry.eval_mode_all();
        loader.reset(None);

        let mut metrics = EvalMetrics::default();
        while let Some(batch) = loader.next_batch() {
            let result =
                validation_losses(&self.forward, &self.registry, &self.stft, &batch, &mut self.rng);
            match result {
                Ok(losses) => {
                    metrics.mel_loss += f64::from(losses.mel);
                    metrics.dur_loss += f64::from(losses.dur);
                    metrics.f0_loss += f64::from(losses.f0);
                    metrics.batches += 1;
                }
                Err(reason) => {
                    metrics.skipped += 1;
                    debug!(epoch, %reason, "validation batch skipped");
                }
            }
        }

        if metrics.batches == 0 {
            warn!(
                epoch,
                skipped = metrics.skipped,
                "no validation batch succeeded; reporting zero losses"
            );
        } else {
            let n = metrics.batches as f64;
            metrics.mel_loss /= n;
            metrics.dur_loss /= n;
            metrics.f0_loss /= n;
        }

        info!(
            "Validation loss: {:.3}, Dur loss: {:.3}, F0 loss: {:.3}",
            metrics.mel_loss, metrics.dur_loss, metrics.f0_loss
        );
        self.sink.add_scalar("eval/mel_loss", metrics.mel_loss, epoch + 1)?;
        self.sink.add_scalar("eval/dur_loss", metrics.dur_loss, epoch + 1)?;
        self.sink.add_scalar("eval/F0_loss", metrics.f0_loss, epoch + 1)?;
        Ok(metrics)
    }

    /// Save a checkpoint for `epoch` and, when `sigma_data` is estimated,
    /// re-dump the configuration with the running mean.
    pub fn save(&mut self, epoch: usize, metrics: &EvalMetrics) -> Result<PathBuf> {
        self.state.record_validation(metrics.mel_loss);
        let estimate = self
            .document
            .config
            .model_params
            .diffusion
            .dist
            .estimate_sigma_data;
        let sigma = if estimate { self.state.mean_sigma() } else { None };

        let metadata = CheckpointMetadata::new(epoch, self.state.iteration, metrics.mel_loss)
            .with_best_val_loss(self.state.best_validation_loss)
            .with_schedulers(self.optimizer.scheduler_states())
            .with_sigma_data(sigma)
            .with_skipped_batches(self.state.skipped_batches);
        let path = self.checkpoints.save(&self.registry, &self.optimizer, &metadata)?;

        if let Some(sigma) = sigma {
            self.document.set_sigma_data(sigma)?;
            let config_path = self.checkpoints.save_config(&self.document, &self.config_name)?;
            debug!(sigma, path = %config_path.display(), "wrote estimated sigma_data");
        }
        Ok(path)
    }

    /// Steps per epoch the schedules were built for.
    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::MemorySink;
    use crate::data::{SyntheticBatches, VecLoader};
    use crate::reference::ReferenceModelBuilder;
    use stylus_audio::loss::StftResolution;
    use tempfile::TempDir;

    fn document(log_dir: &Path) -> ConfigDocument {
        let yaml = format!(
            "log_dir: {}\nepochs: 2\nsave_freq: 1\nlog_interval: 1\nmax_len: 200\nseed: 3\n\
             preprocess_params:\n  sr: 16000\n  spect_params:\n    hop_length: 4\n\
             model_params:\n  n_mels: 8\n  style_dim: 4\n  slm:\n    sr: 16000\n\
             loss_params:\n  diff_epoch: 1\n  joint_epoch: 5\n",
            log_dir.display()
        );
        ConfigDocument::from_yaml(&yaml).unwrap()
    }

    fn orchestrator(dir: &TempDir) -> CurriculumOrchestrator<MemorySink> {
        let doc = document(dir.path());
        let registry = ReferenceModelBuilder::from_config(&doc.config).build(0);
        CurriculumOrchestrator::new(doc, registry, 2, MemorySink::new())
            .unwrap()
            .with_stft_loss(MultiResolutionStftLoss::with_resolutions(
                16000,
                &[StftResolution::new(64, 16, 48)],
                16,
            ))
    }

    #[test]
    fn test_missing_units_are_a_config_error() {
        let dir = TempDir::new().unwrap();
        let mut registry = ModelRegistry::new();
        let full = ReferenceModelBuilder::tiny().build(0);
        registry.insert(names::DECODER, full.get(names::DECODER).unwrap().boxed_clone());
        let err = CurriculumOrchestrator::new(document(dir.path()), registry, 1, MemorySink::new())
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_missing_first_stage_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir);
        assert!(orch.load_initial().unwrap_err().is_config());
    }

    #[test]
    fn test_run_logs_and_saves_each_epoch() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir);
        let dims = ReferenceModelBuilder::from_config(orch.config());
        let mut train = VecLoader::new(SyntheticBatches::new(dims, 2).generate(2, 1));
        let mut val = VecLoader::new(SyntheticBatches::new(dims, 2).generate(1, 2));

        let state = orch.run(&mut train, &mut val).unwrap();
        assert_eq!(state.iteration + state.skipped_batches, 4);
        assert_eq!(state.epoch, 2);
        assert!(state.best_validation_loss.is_finite());

        let sink = orch.sink();
        let eval_steps: Vec<usize> = sink.tagged("eval/mel_loss").map(|r| r.step).collect();
        assert_eq!(eval_steps, vec![1, 2]);
        assert!(sink.lines.iter().all(|l| l.starts_with("Epoch [")));
        assert_eq!(orch.checkpoints().list_checkpoints().unwrap().len(), 2);
        assert!(dir.path().join("config.yml").exists());

        // epoch 1 runs the diffusion group, so sigma_data was estimated and persisted
        let sigma = state
            .mean_sigma()
            .expect("diffusion epoch records sigma estimates");
        assert!(sigma.is_finite() && sigma > 0.0);
        let saved = ConfigDocument::load(dir.path().join("config.yml")).unwrap();
        let written = saved.config.model_params.diffusion.dist.sigma_data;
        assert!((written - sigma).abs() < 1e-6);

        let latest = orch.checkpoints().latest().unwrap().expect("latest checkpoint");
        let meta = CheckpointManager::read_metadata(&latest).unwrap();
        assert_eq!(meta.epoch, 1);
        let stored = meta.sigma_data.expect("checkpoint carries sigma_data");
        assert!((stored - sigma).abs() < 1e-6);
    }

    #[test]
    fn test_empty_validation_reports_zeros() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir);
        let mut val = VecLoader::new(Vec::new());
        let metrics = orch.validate(0, &mut val).unwrap();
        assert_eq!(metrics.batches, 0);
        assert_eq!(metrics.mel_loss, 0.0);
        assert_eq!(orch.sink().last("eval/dur_loss"), Some(0.0));
    }
}
