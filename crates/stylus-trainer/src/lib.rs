//! Second-stage curriculum training for style-based text-to-speech.
//!
//! This crate provides:
//! - The trainable unit contract and a name-keyed model registry
//! - Per-unit AdamW optimizers with one-cycle schedules
//! - Monotonic alignment search
//! - The EDM style sampler and its denoising loss
//! - The speech-LM adversarial stage with gradient surgery
//! - The curriculum orchestrator, checkpoints and metric sinks
//! - Tiny reference units for tests and smoke runs
//!
//! ```ignore
//! use stylus_core::ConfigDocument;
//! use stylus_trainer::{CurriculumOrchestrator, ReferenceModelBuilder, TracingSink};
//!
//! let doc = ConfigDocument::load("Configs/config_ft.yml")?;
//! let registry = ReferenceModelBuilder::from_config(&doc.config).build(doc.config.seed);
//! let mut orchestrator = CurriculumOrchestrator::new(doc, registry, train.num_batches(), TracingSink::new())?;
//! orchestrator.load_initial()?;
//! let state = orchestrator.run(&mut train, &mut val)?;
//! ```

#![warn(missing_docs)]

pub mod adversarial;
pub mod alignment;
pub mod callbacks;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod forward;
pub mod losses;
pub mod multi_optimizer;
pub mod orchestrator;
pub mod reference;
pub mod registry;
pub mod slm;
pub mod style_sampler;
pub mod unit;

pub use adversarial::{AdversarialInputs, AdversarialOutcome, AdversarialStage, GradientSurgery, SurgeryReport};
pub use alignment::{durations, maximum_path, monotonic_path};
pub use callbacks::{FanoutSink, JsonlMetricsSink, MemorySink, ProgressSink, ScalarRecord, TracingSink};
pub use checkpoint::{checkpoint_name, CheckpointManager, CheckpointMetadata, LoadOptions, LoadedCheckpoint};
pub use data::{Batch, BatchLoader, SyntheticBatches, VecLoader};
pub use error::{Result, TrainerError};
pub use forward::{ForwardConfig, ForwardStage, SkipReason, StepLosses, ValidationLosses};
pub use multi_optimizer::{MultiOptimizer, SchedulerState, UnitHyperParams};
pub use orchestrator::{CurriculumOrchestrator, EpochSummary, Startup, StepOutcome, StepReport};
pub use reference::ReferenceModelBuilder;
pub use registry::{names, ModelRegistry, UnitCaller};
pub use slm::SpeechLmCritic;
pub use style_sampler::{KarrasSchedule, StyleSampler};
pub use unit::{Entry, TrainableUnit, UnitParams};
