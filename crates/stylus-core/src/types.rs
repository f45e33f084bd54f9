//! Curriculum and training-state types.

use serde::{Deserialize, Serialize};

use crate::LossParams;

/// Epoch thresholds that gate the optional objective groups.
///
/// Computed once at startup (after any resume offset) and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurriculumThresholds {
    /// First epoch with style diffusion objectives.
    pub diff_epoch: usize,
    /// First epoch with the speech-LM adversarial stage.
    pub joint_epoch: usize,
    /// Exclusive end of the epoch range.
    pub epochs: usize,
}

impl CurriculumThresholds {
    /// Thresholds as written in the configuration.
    pub fn from_config(loss_params: &LossParams, epochs: usize) -> Self {
        Self {
            diff_epoch: loss_params.diff_epoch,
            joint_epoch: loss_params.joint_epoch,
            epochs,
        }
    }

    /// Shift every threshold by the epoch a first-stage checkpoint ended on.
    #[must_use]
    pub fn offset_by(self, start_epoch: usize) -> Self {
        Self {
            diff_epoch: self.diff_epoch + start_epoch,
            joint_epoch: self.joint_epoch + start_epoch,
            epochs: self.epochs + start_epoch,
        }
    }

    /// Whether the style diffusion group is active.
    pub fn diffusion_active(&self, epoch: usize) -> bool {
        epoch >= self.diff_epoch
    }

    /// Whether the adversarial stage is active.
    pub fn adversarial_active(&self, epoch: usize) -> bool {
        epoch >= self.joint_epoch
    }
}

/// Resumable training progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch.
    pub epoch: usize,
    /// Completed training steps across all epochs.
    pub iteration: usize,
    /// Best validation loss seen at a save point.
    pub best_validation_loss: f64,
    /// Batch-wise `sigma_data` estimates, in order.
    pub running_sigma_estimates: Vec<f32>,
    /// Batches skipped because their forward stage was rejected.
    #[serde(default)]
    pub skipped_batches: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            best_validation_loss: f64::INFINITY,
            running_sigma_estimates: Vec::new(),
            skipped_batches: 0,
        }
    }
}

impl TrainingState {
    /// State resumed at an epoch and iteration.
    pub fn resumed(epoch: usize, iteration: usize) -> Self {
        Self {
            epoch,
            iteration,
            ..Self::default()
        }
    }

    /// Mean of all accumulated sigma estimates.
    pub fn mean_sigma(&self) -> Option<f32> {
        if self.running_sigma_estimates.is_empty() {
            return None;
        }
        let sum: f64 = self
            .running_sigma_estimates
            .iter()
            .map(|&s| f64::from(s))
            .sum();
        Some((sum / self.running_sigma_estimates.len() as f64) as f32)
    }

    /// Record a validation loss and return whether it improved on the best.
    pub fn record_validation(&mut self, loss: f64) -> bool {
        if loss < self.best_validation_loss {
            self.best_validation_loss = loss;
            true
        } else {
            false
        }
    }
}

/// Aggregated validation metrics for one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Mean multi-resolution STFT loss.
    pub mel_loss: f64,
    /// Mean duration loss.
    pub dur_loss: f64,
    /// Mean pitch loss.
    pub f0_loss: f64,
    /// Validation batches that contributed.
    pub batches: usize,
    /// Validation batches skipped.
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_offsets_thresholds() {
        let params = LossParams {
            diff_epoch: 10,
            joint_epoch: 30,
            ..Default::default()
        };
        let t = CurriculumThresholds::from_config(&params, 50).offset_by(5);
        assert_eq!(t.diff_epoch, 15);
        assert_eq!(t.joint_epoch, 35);
        assert_eq!(t.epochs, 55);
        assert!(!t.diffusion_active(14));
        assert!(t.diffusion_active(15));
        assert!(!t.adversarial_active(34));
    }

    #[test]
    fn test_mean_sigma() {
        let mut state = TrainingState::default();
        assert!(state.mean_sigma().is_none());
        state.running_sigma_estimates.extend([0.1, 0.3]);
        assert!((state.mean_sigma().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_record_validation() {
        let mut state = TrainingState::default();
        assert!(state.record_validation(1.0));
        assert!(!state.record_validation(2.0));
        assert!(state.record_validation(0.5));
        assert!((state.best_validation_loss - 0.5).abs() < 1e-12);
    }
}
