//! One AdamW optimizer and one learning rate schedule per unit.
//!
//! Units are stepped selectively: discriminators independently of the
//! generator side, the denoiser only once the diffusion group is active.
//! Gradients from every backward pass are accumulated into a shared buffer
//! keyed by global parameter name (`"<unit>.<local>"`), which is what the
//! adversarial stage rescales before stepping.
//!
//! # Example
//!
//! ```ignore
//! use stylus_trainer::MultiOptimizer;
//!
//! let mut optimizer = MultiOptimizer::from_config(&units, &config.optimizer_params, epochs, steps)?;
//! optimizer.zero_grad();
//! optimizer.backward(grads)?;
//! optimizer.step("msd", &mut registry)?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use mlx_rs::{
    array,
    builder::Builder,
    error::Exception,
    optimizers::{AdamW, AdamWBuilder, Optimizer},
    Array,
};
use serde::{Deserialize, Serialize};
use stylus_core::{OneCycleBuilder, OneCycleSchedule, OptimizerParams};

use crate::registry::{names, split_key, ModelRegistry};
use crate::{Result, TrainerError};

/// AdamW hyperparameters of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitHyperParams {
    /// Learning rate before the first scheduler tick.
    pub lr: f32,
    /// Adam betas.
    pub betas: (f32, f32),
    /// Adam epsilon.
    pub eps: f32,
    /// Decoupled weight decay.
    pub weight_decay: f32,
}

impl UnitHyperParams {
    /// Defaults shared by every unit without an override.
    pub fn base(lr: f32) -> Self {
        Self {
            lr,
            betas: (0.0, 0.99),
            eps: 1e-9,
            weight_decay: 1e-4,
        }
    }
}

/// Optimizer and schedule bound to one unit.
#[derive(Debug)]
pub struct UnitOptimizer {
    optimizer: AdamW,
    schedule: OneCycleSchedule,
    hyper: UnitHyperParams,
}

impl UnitOptimizer {
    /// Build from hyperparameters and a schedule.
    pub fn new(hyper: UnitHyperParams, schedule: OneCycleSchedule) -> Result<Self> {
        let optimizer = AdamWBuilder::new(hyper.lr)
            .betas(hyper.betas)
            .eps(hyper.eps)
            .weight_decay(hyper.weight_decay)
            .build()
            .map_err(|_| Exception::custom("Failed to build AdamW optimizer"))?;
        Ok(Self {
            optimizer,
            schedule,
            hyper,
        })
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.optimizer.lr.item::<f32>()
    }

    /// Hyperparameters.
    pub fn hyper(&self) -> &UnitHyperParams {
        &self.hyper
    }

    /// Schedule.
    pub fn schedule(&self) -> &OneCycleSchedule {
        &self.schedule
    }

    /// Number of parameters with optimizer state.
    pub fn state_len(&self) -> usize {
        self.optimizer.state.len()
    }
}

/// Serializable scheduler position of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Scheduler ticks so far.
    pub step: usize,
    /// Learning rate in effect.
    pub lr: f32,
}

/// Per-unit optimizers with a shared gradient buffer.
#[derive(Debug, Default)]
pub struct MultiOptimizer {
    units: BTreeMap<String, UnitOptimizer>,
    grads: HashMap<Rc<str>, Array>,
}

impl MultiOptimizer {
    /// Empty optimizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard fine-tuning setup.
    ///
    /// Every unit gets AdamW with betas `(0.0, 0.99)`, eps `1e-9`, weight decay
    /// `1e-4` and a one-cycle schedule peaking at `lr` with unit div factors.
    /// `bert` peaks at `2 * bert_lr`, `decoder` and `style_encoder` at
    /// `2 * ft_lr`; these three then get their overrides (starting learning
    /// rate, zero floor, and bert's betas and weight decay).
    pub fn from_config(
        unit_names: &[String],
        params: &OptimizerParams,
        epochs: usize,
        steps_per_epoch: usize,
    ) -> Result<Self> {
        let mut optimizer = Self::new();
        for name in unit_names {
            let (max_lr, hyper, start) = match name.as_str() {
                names::BERT => (
                    params.bert_lr * 2.0,
                    UnitHyperParams {
                        lr: params.bert_lr,
                        betas: (0.9, 0.99),
                        eps: 1e-9,
                        weight_decay: 0.01,
                    },
                    Some(params.bert_lr),
                ),
                names::DECODER | names::STYLE_ENCODER => (
                    params.ft_lr * 2.0,
                    UnitHyperParams {
                        lr: params.ft_lr,
                        ..UnitHyperParams::base(params.ft_lr)
                    },
                    Some(params.ft_lr),
                ),
                _ => (params.lr, UnitHyperParams::base(params.lr), None),
            };

            let mut schedule = OneCycleBuilder::new(f64::from(max_lr))
                .epochs(epochs)
                .steps_per_epoch(steps_per_epoch)
                .pct_start(0.0)
                .build();
            if let Some(start) = start {
                schedule = schedule
                    .with_initial_lr(f64::from(start))
                    .with_min_lr(0.0);
            }
            optimizer.add_unit(name.clone(), hyper, schedule)?;
        }
        Ok(optimizer)
    }

    /// Register a unit.
    pub fn add_unit(
        &mut self,
        name: impl Into<String>,
        hyper: UnitHyperParams,
        schedule: OneCycleSchedule,
    ) -> Result<()> {
        self.units
            .insert(name.into(), UnitOptimizer::new(hyper, schedule)?);
        Ok(())
    }

    /// Registered unit names.
    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Access one unit's optimizer.
    pub fn unit(&self, name: &str) -> Result<&UnitOptimizer> {
        self.units
            .get(name)
            .ok_or_else(|| TrainerError::UnknownUnit(name.to_string()))
    }

    /// Clear all accumulated gradients.
    pub fn zero_grad(&mut self) {
        self.grads.clear();
    }

    /// Accumulate gradients keyed by global parameter name.
    pub fn backward(&mut self, grads: HashMap<Rc<str>, Array>) -> Result<()> {
        for (key, grad) in grads {
            match self.grads.get_mut(&key) {
                Some(existing) => *existing = existing.add(&grad)?,
                None => {
                    self.grads.insert(key, grad);
                }
            }
        }
        Ok(())
    }

    /// Accumulated gradients.
    pub fn gradients(&self) -> &HashMap<Rc<str>, Array> {
        &self.grads
    }

    /// L2 norm of the accumulated gradients of one unit (0 if none).
    pub fn unit_grad_norm(&self, unit: &str) -> Result<f32> {
        let prefix = format!("{unit}.");
        let mut sum_sq = Array::from_f32(0.0);
        for (key, grad) in &self.grads {
            if key.starts_with(prefix.as_str()) {
                sum_sq = sum_sq.add(&grad.square()?.sum(None)?)?;
            }
        }
        sum_sq.eval()?;
        Ok(sum_sq.item::<f32>().sqrt())
    }

    /// L2 norm per unit that holds gradients.
    pub fn grad_norms(&self) -> Result<BTreeMap<String, f32>> {
        let mut units: Vec<&str> = self
            .grads
            .keys()
            .filter_map(|k| split_key(k).map(|(u, _)| u))
            .collect();
        units.sort_unstable();
        units.dedup();

        let mut norms = BTreeMap::new();
        for unit in units {
            norms.insert(unit.to_string(), self.unit_grad_norm(unit)?);
        }
        Ok(norms)
    }

    /// Multiply every accumulated gradient by `factor`.
    pub fn scale_all(&mut self, factor: f32) -> Result<()> {
        let factor = Array::from_f32(factor);
        for grad in self.grads.values_mut() {
            *grad = grad.multiply(&factor)?;
        }
        Ok(())
    }

    /// Multiply gradients whose key starts with `prefix`; returns how many.
    pub fn scale_matching(&mut self, prefix: &str, factor: f32) -> Result<usize> {
        let factor = Array::from_f32(factor);
        let mut count = 0;
        for (key, grad) in self.grads.iter_mut() {
            if key.starts_with(prefix) {
                *grad = grad.multiply(&factor)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Apply one unit's optimizer to its accumulated gradients, then tick its
    /// schedule. Other units' parameters and optimizer state are untouched.
    pub fn step(&mut self, unit: &str, registry: &mut ModelRegistry) -> Result<()> {
        let entry = self
            .units
            .get_mut(unit)
            .ok_or_else(|| TrainerError::UnknownUnit(unit.to_string()))?;

        let prefix = format!("{unit}.");
        let mut params = registry.get(unit)?.parameters().clone();
        let mut updated = 0usize;
        for (key, grad) in &self.grads {
            let Some(local) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let local: Rc<str> = Rc::from(local);
            if let Some(param) = params.get_mut(&local) {
                entry.optimizer.update_single(&local, grad, param)?;
                updated += 1;
            }
        }
        registry.set_unit_parameters(unit, params)?;

        let lr = entry.schedule.step();
        entry.optimizer.lr = array!(lr as f32);

        tracing::trace!(unit, updated, lr, "optimizer step");
        Ok(())
    }

    /// Learning rate in effect for a unit.
    pub fn learning_rate(&self, unit: &str) -> Result<f32> {
        Ok(self.unit(unit)?.learning_rate())
    }

    /// First and second moment arrays as `"<unit>.<local>.m"` / `".v"`.
    pub fn state_arrays(&self) -> HashMap<String, Array> {
        let mut arrays = HashMap::new();
        for (unit, entry) in &self.units {
            for (local, (m, v)) in entry.optimizer.state.iter() {
                arrays.insert(format!("{unit}.{local}.m"), m.clone());
                arrays.insert(format!("{unit}.{local}.v"), v.clone());
            }
        }
        arrays
    }

    /// Scheduler positions per unit.
    pub fn scheduler_states(&self) -> BTreeMap<String, SchedulerState> {
        self.units
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    SchedulerState {
                        step: entry.schedule.current_step(),
                        lr: entry.learning_rate(),
                    },
                )
            })
            .collect()
    }

    /// Restore moments and scheduler positions.
    ///
    /// Moment pairs for units that are not registered are ignored.
    pub fn load_state(
        &mut self,
        arrays: &HashMap<String, Array>,
        schedulers: &BTreeMap<String, SchedulerState>,
    ) -> Result<()> {
        let mut moments: HashMap<(String, String), (Option<Array>, Option<Array>)> = HashMap::new();
        for (key, value) in arrays {
            let (stem, slot) = key
                .rsplit_once('.')
                .ok_or_else(|| TrainerError::Checkpoint(format!("bad optimizer key {key}")))?;
            let (unit, local) = split_key(stem)
                .ok_or_else(|| TrainerError::Checkpoint(format!("bad optimizer key {key}")))?;
            let pair = moments
                .entry((unit.to_string(), local.to_string()))
                .or_default();
            match slot {
                "m" => pair.0 = Some(value.clone()),
                "v" => pair.1 = Some(value.clone()),
                _ => {
                    return Err(TrainerError::Checkpoint(format!(
                        "unknown optimizer slot in {key}"
                    )))
                }
            }
        }

        for ((unit, local), pair) in moments {
            let Some(entry) = self.units.get_mut(&unit) else {
                tracing::debug!(unit = %unit, "ignoring optimizer state for unregistered unit");
                continue;
            };
            match pair {
                (Some(m), Some(v)) => {
                    entry.optimizer.state.insert(Rc::from(local.as_str()), (m, v));
                }
                _ => {
                    return Err(TrainerError::Checkpoint(format!(
                        "incomplete moments for {unit}.{local}"
                    )))
                }
            }
        }

        for (unit, state) in schedulers {
            if let Some(entry) = self.units.get_mut(unit) {
                entry.schedule.set_step(state.step);
                entry.optimizer.lr = array!(state.lr);
            }
        }
        Ok(())
    }
}
