//! The trainable unit contract.
//!
//! Every subsystem of the acoustic model (aligner, encoders, predictor,
//! decoder, discriminators, denoiser) is an opaque [`TrainableUnit`]. The
//! trainer never looks inside a unit: it only calls
//! [`TrainableUnit::forward`] with a parameter map and a list of inputs.
//!
//! Forward is functional. The parameter map is passed in explicitly so that
//! the same call works with the unit's own parameters and with the
//! substituted parameters `keyed_value_and_grad` feeds through a loss
//! closure.
//!
//! # Conventions
//!
//! - Masks are `f32` arrays with `1.0` at padded positions, except the `bert`
//!   attention mask which is `1.0` at valid positions.
//! - Lengths are `i32` arrays of shape `[B]`.
//! - Discriminators return `[logits_0, .., logits_{k-1}, features..]` with
//!   `k = num_heads()`.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::error::Exception;
use mlx_rs::Array;

/// Unit-local parameters keyed by local name (`"lstm.weight"`).
pub type UnitParams = HashMap<Rc<str>, Array>;

/// Which computation of a unit to run.
///
/// Most units only have [`Entry::Forward`]. The duration/prosody predictor
/// also exposes its duration head alone and its pitch/energy head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    /// The unit's main computation.
    Forward,
    /// Predictor duration logits only: `[d_en, style, lengths, text_mask]`.
    Durations,
    /// Predictor pitch and energy curves: `[p_en, style]`.
    F0N,
}

/// A named, opaque, trainable subsystem.
pub trait TrainableUnit {
    /// Run the unit with explicit parameters.
    fn forward(
        &self,
        entry: Entry,
        params: &UnitParams,
        inputs: &[&Array],
    ) -> std::result::Result<Vec<Array>, Exception>;

    /// Current parameters.
    fn parameters(&self) -> &UnitParams;

    /// Replace parameters. Keys must match [`TrainableUnit::parameters`].
    fn set_parameters(&mut self, params: UnitParams);

    /// Switch to training behavior.
    fn train_mode(&mut self);

    /// Switch to inference behavior.
    fn eval_mode(&mut self);

    /// Whether the unit is in training mode.
    fn is_training(&self) -> bool;

    /// Deep copy.
    fn boxed_clone(&self) -> Box<dyn TrainableUnit>;

    /// Number of discriminator heads in the output list.
    fn num_heads(&self) -> usize {
        1
    }

    /// Frozen units are never given an optimizer.
    fn frozen(&self) -> bool {
        false
    }

    /// Run with the unit's own parameters.
    fn apply(&self, entry: Entry, inputs: &[&Array]) -> std::result::Result<Vec<Array>, Exception> {
        self.forward(entry, self.parameters(), inputs)
    }

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().values().map(|p| p.size()).sum()
    }
}

/// Look up a required parameter.
pub fn param<'a>(params: &'a UnitParams, name: &str) -> std::result::Result<&'a Array, Exception> {
    params
        .get(name)
        .ok_or_else(|| Exception::custom(format!("missing parameter {name}")))
}

/// First output of a unit call, or an error naming the unit.
pub fn first_output(outputs: Vec<Array>, unit: &str) -> std::result::Result<Array, Exception> {
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| Exception::custom(format!("{unit} returned no outputs")))
}
