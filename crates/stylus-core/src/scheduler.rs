//! One-cycle learning rate schedule.
//!
//! Every trainable unit owns one of these. The schedule has a warmup phase
//! from `initial_lr` to `max_lr` ending at `pct_start * total_steps`, then a
//! cosine anneal from `max_lr` to `min_lr` ending at the last step. With
//! `pct_start = 0` the warmup phase is empty.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// One-cycle learning rate schedule with cosine annealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneCycleSchedule {
    /// Peak learning rate.
    max_lr: f64,
    /// Learning rate at step zero of the warmup phase.
    initial_lr: f64,
    /// Learning rate at the final step.
    min_lr: f64,
    /// Total number of scheduler steps.
    total_steps: usize,
    /// Fraction of steps spent warming up.
    pct_start: f64,
    /// Number of `step()` calls so far.
    current_step: usize,
}

impl OneCycleSchedule {
    /// Create a schedule with explicit endpoints.
    pub fn new(max_lr: f64, initial_lr: f64, min_lr: f64, total_steps: usize, pct_start: f64) -> Self {
        Self {
            max_lr,
            initial_lr,
            min_lr,
            total_steps: total_steps.max(1),
            pct_start: pct_start.clamp(0.0, 1.0),
            current_step: 0,
        }
    }

    /// Override the warmup starting point.
    pub fn with_initial_lr(mut self, initial_lr: f64) -> Self {
        self.initial_lr = initial_lr;
        self
    }

    /// Override the annealing floor.
    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Get learning rate for a specific step.
    #[must_use]
    pub fn get_lr(&self, step: usize) -> f64 {
        let step = step.min(self.total_steps) as f64;
        let warmup_end = self.pct_start * self.total_steps as f64 - 1.0;
        let anneal_end = self.total_steps as f64 - 1.0;

        if step <= warmup_end {
            let pct = if warmup_end > 0.0 { step / warmup_end } else { 1.0 };
            return cosine_anneal(self.initial_lr, self.max_lr, pct);
        }

        let span = anneal_end - warmup_end;
        let pct = if span > 0.0 {
            ((step - warmup_end) / span).min(1.0)
        } else {
            1.0
        };
        cosine_anneal(self.max_lr, self.min_lr, pct)
    }

    /// Get learning rate for the current step.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.get_lr(self.current_step)
    }

    /// Advance the schedule by one step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.current_lr()
    }

    /// Set the current step.
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Get the current step.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Peak learning rate.
    #[must_use]
    pub fn max_lr(&self) -> f64 {
        self.max_lr
    }

    /// Annealing floor.
    #[must_use]
    pub fn min_lr(&self) -> f64 {
        self.min_lr
    }

    /// Total number of steps.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}

/// Builder for [`OneCycleSchedule`].
#[derive(Debug, Clone)]
pub struct OneCycleBuilder {
    max_lr: f64,
    epochs: usize,
    steps_per_epoch: usize,
    pct_start: f64,
    div_factor: f64,
    final_div_factor: f64,
}

impl OneCycleBuilder {
    /// Create a builder with a peak learning rate.
    pub fn new(max_lr: f64) -> Self {
        Self {
            max_lr,
            epochs: 200,
            steps_per_epoch: 1000,
            pct_start: 0.0,
            div_factor: 1.0,
            final_div_factor: 1.0,
        }
    }

    /// Set the number of epochs.
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set steps per epoch.
    pub fn steps_per_epoch(mut self, steps: usize) -> Self {
        self.steps_per_epoch = steps;
        self
    }

    /// Set the warmup fraction.
    pub fn pct_start(mut self, pct: f64) -> Self {
        self.pct_start = pct;
        self
    }

    /// Set `max_lr / initial_lr`.
    pub fn div_factor(mut self, factor: f64) -> Self {
        self.div_factor = factor;
        self
    }

    /// Set `initial_lr / min_lr`.
    pub fn final_div_factor(mut self, factor: f64) -> Self {
        self.final_div_factor = factor;
        self
    }

    /// Build the schedule.
    pub fn build(self) -> OneCycleSchedule {
        let initial_lr = self.max_lr / self.div_factor.max(f64::MIN_POSITIVE);
        let min_lr = initial_lr / self.final_div_factor.max(f64::MIN_POSITIVE);
        let total = self.epochs.saturating_mul(self.steps_per_epoch);
        OneCycleSchedule::new(self.max_lr, initial_lr, min_lr, total, self.pct_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_factors_are_constant() {
        let mut sched = OneCycleBuilder::new(1e-4).epochs(2).steps_per_epoch(10).build();
        for _ in 0..20 {
            assert!((sched.current_lr() - 1e-4).abs() < 1e-12);
            sched.step();
        }
    }

    #[test]
    fn test_zero_floor_anneals_to_zero() {
        let mut sched = OneCycleBuilder::new(2e-5)
            .epochs(1)
            .steps_per_epoch(100)
            .build()
            .with_initial_lr(1e-5)
            .with_min_lr(0.0);

        // pct_start = 0: the first step is already on the annealing curve.
        let first = sched.step();
        assert!(first < 2e-5 && first > 1.99e-5);

        sched.set_step(99);
        assert!(sched.current_lr().abs() < 1e-12);

        sched.set_step(50);
        assert!((sched.current_lr() - 1e-5).abs() < 5e-7);
    }

    #[test]
    fn test_warmup_phase() {
        let sched = OneCycleBuilder::new(1.0)
            .epochs(1)
            .steps_per_epoch(11)
            .pct_start(0.5)
            .div_factor(10.0)
            .final_div_factor(10.0)
            .build();

        assert!((sched.get_lr(0) - 0.1).abs() < 1e-9);
        assert!(sched.get_lr(2) > sched.get_lr(1));
        assert!((sched.get_lr(10) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_steps_past_end_are_clamped() {
        let sched = OneCycleBuilder::new(1.0)
            .epochs(1)
            .steps_per_epoch(10)
            .build()
            .with_min_lr(0.0);
        assert_eq!(sched.get_lr(10), sched.get_lr(1000));
    }
}
