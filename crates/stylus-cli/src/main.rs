//! Stylus CLI - second-stage fine-tuning for style-based text-to-speech.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use stylus_core::{ConfigDocument, CurriculumThresholds};
use stylus_trainer::{
    checkpoint::METADATA_FILE, checkpoint_name, BatchLoader, CheckpointManager,
    CheckpointMetadata, CurriculumOrchestrator, FanoutSink, JsonlMetricsSink, MultiOptimizer,
    ProgressSink, ReferenceModelBuilder, SyntheticBatches, TracingSink, VecLoader,
};

#[derive(Parser)]
#[command(name = "stylus")]
#[command(author, version, about = "Second-stage curriculum fine-tuning for style-based TTS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full curriculum on reference units and synthetic batches
    TrainSmoke {
        /// Path to training configuration file (YAML); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory, overriding the config's log_dir
        #[arg(short, long)]
        log_dir: Option<PathBuf>,

        /// Number of epochs
        #[arg(long, default_value = "2")]
        epochs: usize,

        /// Training batches per epoch
        #[arg(long, default_value = "4")]
        batches: usize,

        /// Utterances per batch
        #[arg(long, default_value = "3")]
        batch_size: usize,

        /// Epoch at which the style diffusion objectives start
        #[arg(long, default_value = "0")]
        diff_epoch: usize,

        /// Epoch at which the speech-LM adversarial stage starts
        #[arg(long, default_value = "1")]
        joint_epoch: usize,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Parse and validate a configuration file
    CheckConfig {
        /// Path to the configuration file (YAML)
        config: PathBuf,
    },

    /// Show the metadata and unit sizes of a checkpoint
    InspectCheckpoint {
        /// Checkpoint directory, or a log directory with a `latest` marker
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::TrainSmoke {
            config,
            log_dir,
            epochs,
            batches,
            batch_size,
            diff_epoch,
            joint_epoch,
            seed,
        } => {
            let mut doc = match config {
                Some(path) => ConfigDocument::load(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => ConfigDocument::from_yaml("")?,
            };
            if let Some(dir) = log_dir {
                doc.set_value(&["log_dir"], dir.display().to_string())?;
            }
            if let Some(seed) = seed {
                doc.set_value(&["seed"], seed)?;
            }
            doc.set_value(&["epochs"], epochs)?;
            doc.set_value(&["batch_size"], batch_size)?;
            doc.set_value(&["loss_params", "diff_epoch"], diff_epoch)?;
            doc.set_value(&["loss_params", "joint_epoch"], joint_epoch)?;
            doc.set_value(&["slmadv_params", "iter"], 1)?;
            doc.set_value(&["slmadv_params", "min_len"], 0)?;
            doc.set_value(&["slmadv_params", "batch_percentage"], 1.0)?;
            run_smoke(doc, batches)
        }
        Commands::CheckConfig { config } => check_config(&config),
        Commands::InspectCheckpoint { path } => inspect_checkpoint(&path),
    }
}

fn run_smoke(mut doc: ConfigDocument, batches: usize) -> anyhow::Result<()> {
    let dims = ReferenceModelBuilder::from_config(&doc.config);
    let seed = doc.config.seed;
    let log_dir = PathBuf::from(&doc.config.log_dir);

    if !doc.config.resumes_second_stage() && doc.config.first_stage_path.is_empty() {
        let first = dims.build(seed);
        let optimizer = MultiOptimizer::from_config(
            &first.trainable_names(),
            &doc.config.optimizer_params,
            1,
            1,
        )?;
        let manager = CheckpointManager::new(log_dir.join("first_stage"))?;
        manager.save(&first, &optimizer, &CheckpointMetadata::new(0, 0, 0.0))?;
        doc.set_value(
            &["first_stage_path"],
            format!("first_stage/{}", checkpoint_name(0)),
        )?;
        tracing::info!("Wrote a fresh first-stage checkpoint for the smoke run");
    }

    let generator = SyntheticBatches::new(dims, doc.config.batch_size);
    let mut train = VecLoader::new(generator.generate(batches, seed)).shuffled(seed);
    let val_batches = batches.div_ceil(2).max(1);
    let mut val = VecLoader::new(generator.generate(val_batches, seed.wrapping_add(1)));

    let progress = ProgressSink::new(doc.config.epochs * train.num_batches());
    let sink = FanoutSink::new()
        .with(TracingSink::new())
        .with(JsonlMetricsSink::new(log_dir.join("metrics.jsonl"))?)
        .with(progress.clone());

    let registry = dims.build(seed.wrapping_add(1));
    let mut orchestrator = CurriculumOrchestrator::new(doc, registry, train.num_batches(), sink)?;
    let startup = orchestrator.load_initial()?;
    tracing::info!(?startup, "Starting smoke run");

    let state = orchestrator.run(&mut train, &mut val)?;
    progress.finish();

    println!("Iterations:        {}", state.iteration);
    println!("Skipped batches:   {}", state.skipped_batches);
    println!("Best val loss:     {:.4}", state.best_validation_loss);
    if let Some(sigma) = state.mean_sigma() {
        println!("Estimated sigma:   {:.4}", sigma);
    }
    if let Some(latest) = orchestrator.checkpoints().latest()? {
        println!("Latest checkpoint: {}", latest.display());
    }
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let doc = ConfigDocument::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    let cfg = &doc.config;
    let thresholds = CurriculumThresholds::from_config(&cfg.loss_params, cfg.epochs);

    println!("Configuration OK: {}", path.display());
    println!("  log_dir:       {}", cfg.log_dir);
    println!("  epochs:        {}", thresholds.epochs);
    println!("  diff_epoch:    {}", thresholds.diff_epoch);
    println!("  joint_epoch:   {}", thresholds.joint_epoch);
    println!("  batch_size:    {}", cfg.batch_size);
    println!("  max_len:       {}", cfg.max_len);
    println!(
        "  lr / bert / ft: {:.2e} / {:.2e} / {:.2e}",
        cfg.optimizer_params.lr, cfg.optimizer_params.bert_lr, cfg.optimizer_params.ft_lr
    );
    for (name, weight) in cfg.loss_params.weights.iter() {
        println!("  {:<13}  {}", name, weight);
    }
    if cfg.resumes_second_stage() {
        println!("  resumes:       {}", cfg.pretrained_model);
    } else if cfg.first_stage_path.is_empty() {
        println!("  warning: no first_stage_path; training would refuse to start");
    } else {
        println!(
            "  first stage:   {}",
            Path::new(&cfg.log_dir).join(&cfg.first_stage_path).display()
        );
    }
    Ok(())
}

fn inspect_checkpoint(path: &Path) -> anyhow::Result<()> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    let dir = if path.join(METADATA_FILE).exists() {
        path.to_path_buf()
    } else {
        match CheckpointManager::new(path)?.latest()? {
            Some(latest) => latest,
            None => bail!("no checkpoint found at {}", path.display()),
        }
    };

    let metadata = CheckpointManager::read_metadata(&dir)?;
    println!("Checkpoint: {}", dir.display());
    println!("{}", serde_json::to_string_pretty(&metadata)?);

    let summary = CheckpointManager::unit_summary(&dir)?;
    let total: usize = summary.values().sum();
    println!("\nUnits:");
    for (unit, count) in &summary {
        println!("  {:<18} {:>10}", unit, count);
    }
    println!("  {:<18} {:>10}", "total", total);
    Ok(())
}
