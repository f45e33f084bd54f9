//! End-to-end curriculum behavior on the reference units.

use std::path::Path;

use mlx_rs::Array;
use stylus_audio::loss::{MultiResolutionStftLoss, StftResolution};
use stylus_core::ConfigDocument;
use stylus_trainer::{
    names, Batch, BatchLoader, CheckpointManager, CheckpointMetadata, CurriculumOrchestrator,
    MemorySink, ModelRegistry, MultiOptimizer, ReferenceModelBuilder, SkipReason, Startup,
    StepOutcome, SyntheticBatches, VecLoader,
};
use tempfile::TempDir;

struct Settings<'a> {
    epochs: usize,
    diff_epoch: usize,
    joint_epoch: usize,
    max_len: usize,
    extra: &'a str,
}

impl Default for Settings<'_> {
    fn default() -> Self {
        Self {
            epochs: 2,
            diff_epoch: 0,
            joint_epoch: 10,
            max_len: 200,
            extra: "",
        }
    }
}

fn document(log_dir: &Path, s: &Settings<'_>) -> ConfigDocument {
    let yaml = format!(
        "log_dir: {}\n\
         epochs: {}\n\
         save_freq: 1\n\
         log_interval: 1\n\
         max_len: {}\n\
         seed: 11\n\
         {}\n\
         preprocess_params:\n  sr: 16000\n  spect_params:\n    hop_length: 4\n\
         model_params:\n  n_mels: 8\n  style_dim: 4\n  slm:\n    sr: 16000\n\
         loss_params:\n  diff_epoch: {}\n  joint_epoch: {}\n\
         slmadv_params:\n  min_len: 0\n  max_len: 16\n  batch_percentage: 1.0\n  iter: 1\n",
        log_dir.display(),
        s.epochs,
        s.max_len,
        s.extra,
        s.diff_epoch,
        s.joint_epoch,
    );
    ConfigDocument::from_yaml(&yaml).unwrap()
}

fn small_stft() -> MultiResolutionStftLoss {
    MultiResolutionStftLoss::with_resolutions(
        16000,
        &[StftResolution::new(64, 16, 48), StftResolution::new(128, 32, 96)],
        16,
    )
}

fn orchestrator(doc: ConfigDocument, seed: u64) -> CurriculumOrchestrator<MemorySink> {
    let registry = ReferenceModelBuilder::from_config(&doc.config).build(seed);
    CurriculumOrchestrator::new(doc, registry, 2, MemorySink::new())
        .unwrap()
        .with_stft_loss(small_stft())
}

/// Orchestrator whose predictor emits near-maximal durations, so every
/// adversarial clip clears the clip length and the stage always applies.
fn saturated_orchestrator(doc: ConfigDocument, seed: u64) -> CurriculumOrchestrator<MemorySink> {
    let mut registry = ReferenceModelBuilder::from_config(&doc.config).build(seed);
    let mut params = registry.get(names::PREDICTOR).unwrap().parameters().clone();
    let shape = params["duration_proj.bias"].shape().to_vec();
    params.insert(
        "duration_proj.bias".into(),
        mlx_rs::ops::full::<f32>(&shape, Array::from_f32(10.0)).unwrap(),
    );
    registry.set_unit_parameters(names::PREDICTOR, params).unwrap();
    CurriculumOrchestrator::new(doc, registry, 2, MemorySink::new())
        .unwrap()
        .with_stft_loss(small_stft())
}

fn batches(doc: &ConfigDocument, count: usize, seed: u64) -> Vec<Batch> {
    SyntheticBatches::new(ReferenceModelBuilder::from_config(&doc.config), 3).generate(count, seed)
}

fn bits(a: &Array) -> Vec<u32> {
    a.eval().unwrap();
    a.as_slice::<f32>().iter().map(|x| x.to_bits()).collect()
}

fn scheduler_steps(optimizer: &MultiOptimizer) -> Vec<(String, usize)> {
    optimizer
        .scheduler_states()
        .into_iter()
        .map(|(unit, state)| (unit, state.step))
        .collect()
}

#[test]
fn style_losses_are_zero_before_diff_epoch() {
    let dir = TempDir::new().unwrap();
    let doc = document(
        dir.path(),
        &Settings {
            diff_epoch: 3,
            ..Settings::default()
        },
    );
    let data = batches(&doc, 3, 4);
    let mut orch = orchestrator(doc, 0);

    let mut trained = 0;
    for (i, batch) in data.iter().enumerate() {
        if let StepOutcome::Trained(report) = orch.train_step(2, i, batch).unwrap() {
            assert_eq!(report.losses.sty, 0.0);
            assert_eq!(report.losses.diff, 0.0);
            trained += 1;
        }
    }
    assert!(trained > 0);
    assert!(orch.state().running_sigma_estimates.is_empty());
    assert_eq!(orch.optimizer().unit(names::DIFFUSION).unwrap().schedule().current_step(), 0);
}

#[test]
fn adversarial_stage_waits_for_joint_epoch() {
    let dir = TempDir::new().unwrap();
    let doc = document(
        dir.path(),
        &Settings {
            epochs: 3,
            diff_epoch: 0,
            joint_epoch: 2,
            ..Settings::default()
        },
    );
    let mut loader = VecLoader::new(batches(&doc, 2, 8));
    let mut orch = saturated_orchestrator(doc, 1);

    loader.reset(None);
    let before = orch.optimizer().unit(names::WD).unwrap().schedule().current_step();
    let summary = orch.train_epoch(1, &mut loader).unwrap();
    assert!(summary.trained > 0);
    assert_eq!(summary.adversarial_invoked, 0);
    assert_eq!(
        orch.optimizer().unit(names::WD).unwrap().schedule().current_step(),
        before
    );
    let sink = orch.sink();
    assert!(sink.tagged("train/gen_loss_slm").all(|r| r.value == 0.0));

    loader.reset(None);
    let summary = orch.train_epoch(2, &mut loader).unwrap();
    assert!(summary.trained > 0);
    assert_eq!(summary.adversarial_invoked, summary.trained);
    assert_eq!(summary.adversarial_applied, summary.trained);
    assert!(orch.optimizer().unit(names::WD).unwrap().schedule().current_step() > before);
    let sink = orch.sink();
    assert!(sink.tagged("train/gen_loss_slm").any(|r| r.value != 0.0));
}

#[test]
fn first_stage_resume_offsets_the_curriculum() {
    let dir = TempDir::new().unwrap();
    let doc = document(
        dir.path(),
        &Settings {
            epochs: 20,
            diff_epoch: 10,
            joint_epoch: 12,
            extra: "first_stage_path: first_stage/epoch_2nd_00005",
            ..Settings::default()
        },
    );

    let first: ModelRegistry = ReferenceModelBuilder::from_config(&doc.config).build(42);
    let first_optimizer =
        MultiOptimizer::from_config(&first.trainable_names(), &Default::default(), 1, 1).unwrap();
    let manager = CheckpointManager::new(dir.path().join("first_stage")).unwrap();
    manager
        .save(&first, &first_optimizer, &CheckpointMetadata::new(5, 900, 0.3))
        .unwrap();

    let mut orch = orchestrator(doc, 0);
    let bert_before = orch.registry().get(names::BERT).unwrap().parameters()["layer.weight"].clone();

    let startup = orch.load_initial().unwrap();
    assert!(matches!(startup, Startup::FirstStage { start_epoch: 5, .. }));
    let t = orch.thresholds();
    assert_eq!(t.diff_epoch, 15);
    assert_eq!(t.joint_epoch, 17);
    assert_eq!(t.epochs, 25);
    assert_eq!(orch.state().epoch, 5);
    assert_eq!(orch.state().iteration, 0);

    let registry = orch.registry();
    let decoder = &registry.get(names::DECODER).unwrap().parameters()["asr.weight"];
    let stored = &first.get(names::DECODER).unwrap().parameters()["asr.weight"];
    assert_eq!(bits(decoder), bits(stored));

    let bert = &registry.get(names::BERT).unwrap().parameters()["layer.weight"];
    assert_eq!(bits(bert), bits(&bert_before));

    let style = &registry.get(names::STYLE_ENCODER).unwrap().parameters()["proj.weight"];
    let prosody = &registry.get(names::PREDICTOR_ENCODER).unwrap().parameters()["proj.weight"];
    assert_eq!(bits(style), bits(prosody));
}

#[test]
fn second_stage_resume_is_bit_identical() {
    let dir = TempDir::new().unwrap();
    let doc = document(
        dir.path(),
        &Settings {
            epochs: 1,
            ..Settings::default()
        },
    );
    let mut train = VecLoader::new(batches(&doc, 2, 3));
    let mut val = VecLoader::new(batches(&doc, 1, 5));
    let mut orch = orchestrator(doc, 2);
    let state = orch.run(&mut train, &mut val).unwrap();
    let saved = orch.checkpoints().latest().unwrap().unwrap();

    let resume_dir = TempDir::new().unwrap();
    let doc = document(
        resume_dir.path(),
        &Settings {
            epochs: 3,
            extra: &format!(
                "pretrained_model: {}\nsecond_stage_load_pretrained: true\nload_only_params: false",
                saved.display()
            ),
            ..Settings::default()
        },
    );
    let mut resumed = orchestrator(doc, 99);
    let startup = resumed.load_initial().unwrap();
    assert!(matches!(startup, Startup::SecondStage { start_epoch: 1, .. }));
    assert_eq!(resumed.state().iteration, state.iteration);
    assert_eq!(resumed.state().epoch, 1);

    let before = orch.optimizer().state_arrays();
    let after = resumed.optimizer().state_arrays();
    assert_eq!(before.len(), after.len());
    for (key, value) in &before {
        assert_eq!(bits(value), bits(&after[key]), "moment {key}");
    }
    assert_eq!(scheduler_steps(orch.optimizer()), scheduler_steps(resumed.optimizer()));

    let a = &orch.registry().get(names::PREDICTOR).unwrap().parameters()["lstm.weight"];
    let b = &resumed.registry().get(names::PREDICTOR).unwrap().parameters()["lstm.weight"];
    assert_eq!(bits(a), bits(b));
}

#[test]
fn narrow_crop_skips_without_updates() {
    let dir = TempDir::new().unwrap();
    let doc = document(
        dir.path(),
        &Settings {
            max_len: 79,
            ..Settings::default()
        },
    );
    let data = batches(&doc, 1, 0);
    let mut orch = orchestrator(doc, 0);
    let steps = scheduler_steps(orch.optimizer());

    match orch.train_step(0, 0, &data[0]).unwrap() {
        StepOutcome::Skipped(SkipReason::NarrowCrop { width, floor }) => {
            assert_eq!(width, 78);
            assert_eq!(floor, 80);
        }
        other => panic!("expected a narrow crop skip, got {other:?}"),
    }
    assert_eq!(orch.state().iteration, 0);
    assert_eq!(orch.state().skipped_batches, 1);
    assert_eq!(scheduler_steps(orch.optimizer()), steps);
    assert!(orch.optimizer().state_arrays().is_empty());
}
