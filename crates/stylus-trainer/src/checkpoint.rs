//! Checkpoint save/load.
//!
//! A checkpoint is a directory `epoch_2nd_00004/` holding unit weights and
//! optimizer moments as safetensors plus a JSON metadata file. A `latest`
//! marker in the checkpoint root names the most recent one.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use stylus_core::ConfigDocument;

use crate::multi_optimizer::{MultiOptimizer, SchedulerState};
use crate::registry::{group_by_unit, split_key, ModelRegistry};
use crate::{Result, TrainerError};

/// Unit weights file.
pub const UNITS_FILE: &str = "units.safetensors";
/// Optimizer moments file.
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
/// Metadata file.
pub const METADATA_FILE: &str = "metadata.json";
/// Marker naming the most recent checkpoint.
pub const LATEST_MARKER: &str = "latest";

const PREFIX: &str = "epoch_2nd_";

/// Directory name of the checkpoint saved at `epoch`.
pub fn checkpoint_name(epoch: usize) -> String {
    format!("{PREFIX}{epoch:05}")
}

/// Training progress stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch the checkpoint was saved at.
    pub epoch: usize,
    /// Completed training steps.
    pub iters: usize,
    /// Validation loss of that epoch.
    pub val_loss: f64,
    /// Best validation loss so far.
    pub best_val_loss: Option<f64>,
    /// Scheduler position per unit.
    #[serde(default)]
    pub schedulers: BTreeMap<String, SchedulerState>,
    /// Running `sigma_data` estimate.
    #[serde(default)]
    pub sigma_data: Option<f32>,
    /// Batches skipped so far.
    #[serde(default)]
    pub skipped_batches: usize,
    /// Seconds since the Unix epoch.
    pub timestamp: String,
}

impl CheckpointMetadata {
    /// Metadata for a save at `epoch`.
    pub fn new(epoch: usize, iters: usize, val_loss: f64) -> Self {
        Self {
            epoch,
            iters,
            val_loss,
            best_val_loss: None,
            schedulers: BTreeMap::new(),
            sigma_data: None,
            skipped_batches: 0,
            timestamp: unix_timestamp(),
        }
    }

    /// Set the best validation loss; non-finite values are dropped.
    pub fn with_best_val_loss(mut self, loss: f64) -> Self {
        self.best_val_loss = loss.is_finite().then_some(loss);
        self
    }

    /// Set the scheduler positions.
    pub fn with_schedulers(mut self, schedulers: BTreeMap<String, SchedulerState>) -> Self {
        self.schedulers = schedulers;
        self
    }

    /// Set the running `sigma_data` estimate.
    pub fn with_sigma_data(mut self, sigma: Option<f32>) -> Self {
        self.sigma_data = sigma;
        self
    }

    /// Set the skipped batch count.
    pub fn with_skipped_batches(mut self, skipped: usize) -> Self {
        self.skipped_batches = skipped;
        self
    }
}

fn unix_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

/// What to restore from a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Units whose weights are left untouched.
    pub ignore: Vec<String>,
    /// Restore weights only, not optimizer state.
    pub params_only: bool,
}

impl LoadOptions {
    /// Restore weights and optimizer state.
    pub fn full() -> Self {
        Self::default()
    }

    /// Restore weights only.
    pub fn params_only() -> Self {
        Self {
            params_only: true,
            ..Self::default()
        }
    }

    /// Leave the listed units untouched.
    #[must_use]
    pub fn ignoring<S: AsRef<str>>(mut self, units: &[S]) -> Self {
        self.ignore
            .extend(units.iter().map(|u| u.as_ref().to_string()));
        self
    }

    fn ignores(&self, unit: &str) -> bool {
        self.ignore.iter().any(|u| u == unit)
    }
}

/// Result of a load.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    /// Stored metadata.
    pub metadata: CheckpointMetadata,
    /// Units whose weights were restored.
    pub restored: Vec<String>,
    /// Whether optimizer moments and schedules were restored.
    pub optimizer_restored: bool,
}

/// Saves and restores checkpoints under one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: Option<usize>,
}

impl CheckpointManager {
    /// Manager rooted at `checkpoint_dir`, created if missing.
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir).map_err(|e| {
            TrainerError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create checkpoint directory: {}", e),
            ))
        })?;
        Ok(Self {
            checkpoint_dir,
            max_checkpoints: None,
        })
    }

    /// Keep at most `max` checkpoints.
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = Some(max);
        self
    }

    /// Root directory.
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Write every unit, the optimizer state and `metadata`.
    pub fn save(
        &self,
        registry: &ModelRegistry,
        optimizer: &MultiOptimizer,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let name = checkpoint_name(metadata.epoch);
        let dir = self.checkpoint_dir.join(&name);
        fs::create_dir_all(&dir)?;

        Array::save_safetensors(registry.all_parameters(), None, dir.join(UNITS_FILE))
            .map_err(|e| TrainerError::Checkpoint(format!("Failed to save weights: {e}")))?;

        let moments: HashMap<Rc<str>, Array> = optimizer
            .state_arrays()
            .into_iter()
            .map(|(k, v)| (Rc::from(k.as_str()), v))
            .collect();
        if !moments.is_empty() {
            Array::save_safetensors(moments, None, dir.join(OPTIMIZER_FILE)).map_err(|e| {
                TrainerError::Checkpoint(format!("Failed to save optimizer state: {e}"))
            })?;
        }

        let json = serde_json::to_string_pretty(metadata)?;
        let mut file = File::create(dir.join(METADATA_FILE))?;
        file.write_all(json.as_bytes())?;

        self.update_latest(&name)?;
        self.cleanup_old_checkpoints()?;

        tracing::info!(epoch = metadata.epoch, iters = metadata.iters, path = %dir.display(), "Saved checkpoint");
        Ok(dir)
    }

    fn update_latest(&self, name: &str) -> Result<()> {
        let mut file = File::create(self.checkpoint_dir.join(LATEST_MARKER))?;
        file.write_all(name.as_bytes())?;
        Ok(())
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let Some(max) = self.max_checkpoints else {
            return Ok(());
        };
        let mut checkpoints = self.list_checkpoints()?;
        while checkpoints.len() > max {
            let (epoch, path) = checkpoints.remove(0);
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!("Failed to remove old checkpoint {}: {}", epoch, e);
            } else {
                tracing::debug!("Removed old checkpoint at epoch {}", epoch);
            }
        }
        Ok(())
    }

    /// Checkpoints under the root, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints: Vec<(usize, PathBuf)> = fs::read_dir(&self.checkpoint_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let epoch = name.strip_prefix(PREFIX)?.parse::<usize>().ok()?;
                entry.path().is_dir().then(|| (epoch, entry.path()))
            })
            .collect();
        checkpoints.sort_by_key(|(epoch, _)| *epoch);
        Ok(checkpoints)
    }

    /// Path named by the `latest` marker, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let marker = self.checkpoint_dir.join(LATEST_MARKER);
        if !marker.exists() {
            return Ok(None);
        }
        let mut name = String::new();
        File::open(&marker)?.read_to_string(&mut name)?;
        let path = self.checkpoint_dir.join(name.trim());
        Ok(path.exists().then_some(path))
    }

    /// Re-dump the configuration next to the checkpoints.
    pub fn save_config(&self, document: &ConfigDocument, file_name: &str) -> Result<PathBuf> {
        let path = self.checkpoint_dir.join(file_name);
        document.write(&path)?;
        Ok(path)
    }

    /// Read only the metadata of a checkpoint.
    pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<CheckpointMetadata> {
        let path = path.as_ref().join(METADATA_FILE);
        let mut json = String::new();
        File::open(&path)
            .map_err(|e| {
                TrainerError::Checkpoint(format!("Failed to open {}: {}", path.display(), e))
            })?
            .read_to_string(&mut json)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Element count per unit stored in a checkpoint.
    pub fn unit_summary<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, usize>> {
        let weights = load_arrays(&path.as_ref().join(UNITS_FILE))?;
        let mut summary = BTreeMap::new();
        for (key, value) in &weights {
            if let Some((unit, _)) = split_key(key) {
                *summary.entry(unit.to_string()).or_insert(0) += value.size();
            }
        }
        Ok(summary)
    }

    /// Restore a checkpoint into `registry` and, unless params-only,
    /// `optimizer`.
    ///
    /// Units absent from the checkpoint keep their weights. A stored unit
    /// whose parameter names differ from the registered unit is an error.
    pub fn load<P: AsRef<Path>>(
        path: P,
        registry: &mut ModelRegistry,
        optimizer: Option<&mut MultiOptimizer>,
        options: &LoadOptions,
    ) -> Result<LoadedCheckpoint> {
        let path = path.as_ref();
        let metadata = Self::read_metadata(path)?;

        let weights: HashMap<Rc<str>, Array> = load_arrays(&path.join(UNITS_FILE))?
            .into_iter()
            .map(|(k, v)| (Rc::from(k.as_str()), v))
            .collect();
        let grouped = group_by_unit(&weights);

        let names: Vec<String> = registry.names().map(str::to_string).collect();
        let mut restored = Vec::new();
        for name in names {
            if options.ignores(&name) {
                continue;
            }
            let Some(stored) = grouped.get(&name) else {
                continue;
            };
            let current = registry.get(&name)?.parameters();
            let mismatch = stored.len() != current.len()
                || stored.keys().any(|k| !current.contains_key(k));
            if mismatch {
                return Err(TrainerError::Checkpoint(format!(
                    "parameters of {name} do not match the registered unit"
                )));
            }
            registry.set_unit_parameters(&name, stored.clone())?;
            restored.push(name);
        }
        for unit in grouped.keys().filter(|u| !registry.contains(u)) {
            tracing::debug!(unit = %unit, "checkpoint unit not registered, skipped");
        }

        let mut optimizer_restored = false;
        if let Some(optimizer) = optimizer {
            if !options.params_only {
                let moments_path = path.join(OPTIMIZER_FILE);
                let moments = if moments_path.exists() {
                    load_arrays(&moments_path)?
                } else {
                    HashMap::new()
                };
                let moments: HashMap<String, Array> = moments
                    .into_iter()
                    .filter(|(k, _)| {
                        split_key(k).map_or(true, |(unit, _)| !options.ignores(unit))
                    })
                    .collect();
                let schedulers: BTreeMap<String, SchedulerState> = metadata
                    .schedulers
                    .iter()
                    .filter(|(unit, _)| !options.ignores(unit))
                    .map(|(unit, state)| (unit.clone(), *state))
                    .collect();
                optimizer.load_state(&moments, &schedulers)?;
                optimizer_restored = true;
            }
        }

        tracing::info!(
            epoch = metadata.epoch,
            iters = metadata.iters,
            units = restored.len(),
            optimizer = optimizer_restored,
            "Loaded checkpoint from {:?}",
            path
        );
        Ok(LoadedCheckpoint {
            metadata,
            restored,
            optimizer_restored,
        })
    }
}

fn load_arrays(path: &Path) -> Result<HashMap<String, Array>> {
    Array::load_safetensors(path)
        .map_err(|e| TrainerError::Checkpoint(format!("Failed to load {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceModelBuilder;
    use crate::registry::names;
    use stylus_core::OptimizerParams;
    use tempfile::TempDir;

    fn optimizer_for(registry: &ModelRegistry) -> MultiOptimizer {
        MultiOptimizer::from_config(&registry.trainable_names(), &OptimizerParams::default(), 3, 4)
            .unwrap()
    }

    fn trained() -> (ModelRegistry, MultiOptimizer) {
        let mut registry = ReferenceModelBuilder::tiny().build(0);
        let mut optimizer = optimizer_for(&registry);
        for unit in [names::DECODER, names::WD] {
            let grads: HashMap<Rc<str>, Array> = registry
                .flat_parameters(&[unit])
                .unwrap()
                .into_iter()
                .map(|(k, v)| {
                    let g = mlx_rs::ops::full::<f32>(v.shape(), Array::from_f32(1.0)).unwrap();
                    (k, g)
                })
                .collect();
            optimizer.zero_grad();
            optimizer.backward(grads).unwrap();
            optimizer.step(unit, &mut registry).unwrap();
        }
        (registry, optimizer)
    }

    fn bits(a: &Array) -> Vec<u32> {
        a.eval().unwrap();
        a.as_slice::<f32>().iter().map(|x| x.to_bits()).collect()
    }

    #[test]
    fn test_metadata_builder() {
        let meta = CheckpointMetadata::new(4, 120, 0.5)
            .with_best_val_loss(f64::INFINITY)
            .with_sigma_data(Some(0.3))
            .with_skipped_batches(2);
        assert_eq!(meta.best_val_loss, None);
        assert_eq!(meta.sigma_data, Some(0.3));
        assert_eq!(meta.skipped_batches, 2);
        assert_eq!(checkpoint_name(4), "epoch_2nd_00004");
    }

    #[test]
    fn test_save_then_full_load_is_bit_identical() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).unwrap();
        let (registry, optimizer) = trained();
        let meta = CheckpointMetadata::new(1, 8, 0.25)
            .with_best_val_loss(0.25)
            .with_schedulers(optimizer.scheduler_states());
        let path = manager.save(&registry, &optimizer, &meta).unwrap();
        assert_eq!(manager.latest().unwrap(), Some(path.clone()));

        let mut fresh = ReferenceModelBuilder::tiny().build(99);
        let mut restored = optimizer_for(&fresh);
        let loaded =
            CheckpointManager::load(&path, &mut fresh, Some(&mut restored), &LoadOptions::full())
                .unwrap();
        assert!(loaded.optimizer_restored);
        assert_eq!(loaded.metadata.iters, 8);
        assert_eq!(loaded.metadata.epoch, 1);

        let before = optimizer.state_arrays();
        let after = restored.state_arrays();
        assert_eq!(before.len(), after.len());
        for (key, value) in &before {
            assert_eq!(bits(value), bits(&after[key]), "moment {key}");
        }
        assert_eq!(restored.scheduler_states(), optimizer.scheduler_states());

        let w0 = &registry.get(names::DECODER).unwrap().parameters()["asr.weight"];
        let w1 = &fresh.get(names::DECODER).unwrap().parameters()["asr.weight"];
        assert_eq!(bits(w0), bits(w1));
    }

    #[test]
    fn test_params_only_with_ignored_units() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).unwrap();
        let (registry, optimizer) = trained();
        let path = manager
            .save(&registry, &optimizer, &CheckpointMetadata::new(5, 40, 1.0))
            .unwrap();

        let mut fresh = ReferenceModelBuilder::tiny().build(7);
        let untouched = fresh.get(names::WD).unwrap().parameters()["weight"].clone();
        let mut restored = optimizer_for(&fresh);
        let options = LoadOptions::params_only().ignoring(&[names::WD]);
        let loaded = CheckpointManager::load(&path, &mut fresh, Some(&mut restored), &options).unwrap();

        assert!(!loaded.optimizer_restored);
        assert!(!loaded.restored.iter().any(|u| u == names::WD));
        assert!(loaded.restored.iter().any(|u| u == names::DECODER));
        assert_eq!(restored.state_arrays().len(), 0);
        assert_eq!(
            bits(&fresh.get(names::WD).unwrap().parameters()["weight"]),
            bits(&untouched)
        );
    }

    #[test]
    fn test_cleanup_and_listing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path())
            .unwrap()
            .with_max_checkpoints(2);
        let (registry, optimizer) = trained();
        for epoch in [1, 3, 5] {
            manager
                .save(&registry, &optimizer, &CheckpointMetadata::new(epoch, epoch * 10, 0.5))
                .unwrap();
        }
        let epochs: Vec<usize> = manager.list_checkpoints().unwrap().iter().map(|(e, _)| *e).collect();
        assert_eq!(epochs, vec![3, 5]);
        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(CheckpointManager::read_metadata(&latest).unwrap().epoch, 5);

        let summary = CheckpointManager::unit_summary(&latest).unwrap();
        assert!(summary[names::DECODER] > 0);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = ReferenceModelBuilder::tiny().build(0);
        let err = CheckpointManager::load(
            temp_dir.path().join("nope"),
            &mut registry,
            None,
            &LoadOptions::params_only(),
        )
        .unwrap_err();
        assert!(matches!(err, TrainerError::Checkpoint(_)));
    }
}
