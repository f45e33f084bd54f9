//! Named collection of trainable units.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use mlx_rs::error::Exception;
use mlx_rs::Array;

use crate::unit::{first_output, Entry, TrainableUnit, UnitParams};
use crate::{Result, TrainerError};

/// Canonical unit names.
pub mod names {
    /// Text-to-frame aligner with phoneme posteriors.
    pub const TEXT_ALIGNER: &str = "text_aligner";
    /// Frozen-in-practice pitch extractor.
    pub const PITCH_EXTRACTOR: &str = "pitch_extractor";
    /// Phoneme-level language model.
    pub const BERT: &str = "bert";
    /// Projection from bert hidden states to predictor input.
    pub const BERT_ENCODER: &str = "bert_encoder";
    /// Acoustic text encoder.
    pub const TEXT_ENCODER: &str = "text_encoder";
    /// Duration and prosody predictor.
    pub const PREDICTOR: &str = "predictor";
    /// Prosodic style encoder.
    pub const PREDICTOR_ENCODER: &str = "predictor_encoder";
    /// Acoustic style encoder.
    pub const STYLE_ENCODER: &str = "style_encoder";
    /// Waveform decoder.
    pub const DECODER: &str = "decoder";
    /// Style denoiser network.
    pub const DIFFUSION: &str = "diffusion";
    /// Multi-period discriminator.
    pub const MPD: &str = "mpd";
    /// Multi-scale discriminator.
    pub const MSD: &str = "msd";
    /// Speech-LM feature discriminator.
    pub const WD: &str = "wd";
    /// Frozen speech representation model.
    pub const SLM: &str = "slm";

    /// Units a first-stage checkpoint does not provide.
    pub const FIRST_STAGE_IGNORED: [&str; 8] = [
        BERT,
        BERT_ENCODER,
        PREDICTOR,
        PREDICTOR_ENCODER,
        MSD,
        MPD,
        WD,
        DIFFUSION,
    ];

    /// Every role the curriculum needs.
    pub const REQUIRED: [&str; 14] = [
        TEXT_ALIGNER,
        PITCH_EXTRACTOR,
        BERT,
        BERT_ENCODER,
        TEXT_ENCODER,
        PREDICTOR,
        PREDICTOR_ENCODER,
        STYLE_ENCODER,
        DECODER,
        DIFFUSION,
        MPD,
        MSD,
        WD,
        SLM,
    ];
}

/// Global parameter key `"<unit>.<local>"`.
pub fn global_key(unit: &str, local: &str) -> Rc<str> {
    Rc::from(format!("{unit}.{local}"))
}

/// Split a global key into unit and local name.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('.')
}

/// Holds every unit by name.
///
/// Pure data holder: enumeration, lookup and flat parameter views.
#[derive(Default)]
pub struct ModelRegistry {
    units: BTreeMap<String, Box<dyn TrainableUnit>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a unit.
    pub fn insert(&mut self, name: impl Into<String>, unit: Box<dyn TrainableUnit>) {
        self.units.insert(name.into(), unit);
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, unit: Box<dyn TrainableUnit>) -> Self {
        self.insert(name, unit);
        self
    }

    /// Look up a unit.
    pub fn get(&self, name: &str) -> Result<&dyn TrainableUnit> {
        self.units
            .get(name)
            .map(|u| u.as_ref())
            .ok_or_else(|| TrainerError::UnknownUnit(name.to_string()))
    }

    /// Look up a unit mutably.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Box<dyn TrainableUnit>> {
        self.units
            .get_mut(name)
            .ok_or_else(|| TrainerError::UnknownUnit(name.to_string()))
    }

    /// Whether a unit is present.
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Unit names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Names of required roles that are missing.
    pub fn missing_roles(&self) -> Vec<&'static str> {
        names::REQUIRED
            .iter()
            .copied()
            .filter(|n| !self.contains(n))
            .collect()
    }

    /// Replace `dst` with a deep copy of `src`.
    pub fn copy_unit(&mut self, src: &str, dst: &str) -> Result<()> {
        let copy = self.get(src)?.boxed_clone();
        self.units.insert(dst.to_string(), copy);
        Ok(())
    }

    /// Flat `"<unit>.<local>"` map over the given units.
    pub fn flat_parameters(&self, units: &[&str]) -> Result<HashMap<Rc<str>, Array>> {
        let mut flat = HashMap::new();
        for &name in units {
            for (local, value) in self.get(name)?.parameters() {
                flat.insert(global_key(name, local), value.clone());
            }
        }
        Ok(flat)
    }

    /// Flat map over every unit.
    pub fn all_parameters(&self) -> HashMap<Rc<str>, Array> {
        let mut flat = HashMap::new();
        for (name, unit) in &self.units {
            for (local, value) in unit.parameters() {
                flat.insert(global_key(name, local), value.clone());
            }
        }
        flat
    }

    /// Set one unit's parameters from unit-local keys.
    pub fn set_unit_parameters(&mut self, name: &str, params: UnitParams) -> Result<()> {
        self.get_mut(name)?.set_parameters(params);
        Ok(())
    }

    /// Put every unit in training mode, then the listed ones back to eval.
    pub fn train_mode_except(&mut self, eval_units: &[&str]) {
        for (name, unit) in self.units.iter_mut() {
            if eval_units.contains(&name.as_str()) || unit.frozen() {
                unit.eval_mode();
            } else {
                unit.train_mode();
            }
        }
    }

    /// Put every unit in eval mode.
    pub fn eval_mode_all(&mut self) {
        for unit in self.units.values_mut() {
            unit.eval_mode();
        }
    }

    /// Names of units with an optimizer.
    pub fn trainable_names(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|(_, u)| !u.frozen())
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Calls units through the registry, substituting parameters for the units
/// being differentiated.
///
/// Inside a `keyed_value_and_grad` closure the overridden units read their
/// parameters from the traced map; every other unit uses its own.
pub struct UnitCaller<'a> {
    registry: &'a ModelRegistry,
    overrides: BTreeMap<String, UnitParams>,
}

impl<'a> UnitCaller<'a> {
    /// Caller using every unit's own parameters.
    pub fn new(registry: &'a ModelRegistry) -> Self {
        Self {
            registry,
            overrides: BTreeMap::new(),
        }
    }

    /// Caller substituting the units present in a flat `"<unit>.<local>"` map.
    pub fn with_flat(registry: &'a ModelRegistry, flat: &HashMap<Rc<str>, Array>) -> Self {
        Self {
            registry,
            overrides: group_by_unit(flat),
        }
    }

    /// Look up a unit.
    pub fn unit(&self, name: &str) -> std::result::Result<&'a dyn TrainableUnit, Exception> {
        self.registry.get(name).map_err(Exception::from)
    }

    /// Parameters a call to `name` would use.
    pub fn params(&self, name: &str) -> std::result::Result<&UnitParams, Exception> {
        match self.overrides.get(name) {
            Some(params) => Ok(params),
            None => Ok(self.unit(name)?.parameters()),
        }
    }

    /// Run a unit.
    pub fn call(
        &self,
        name: &str,
        entry: Entry,
        inputs: &[&Array],
    ) -> std::result::Result<Vec<Array>, Exception> {
        self.unit(name)?.forward(entry, self.params(name)?, inputs)
    }

    /// Run a unit and keep its first output.
    pub fn first(
        &self,
        name: &str,
        entry: Entry,
        inputs: &[&Array],
    ) -> std::result::Result<Array, Exception> {
        first_output(self.call(name, entry, inputs)?, name)
    }
}

/// Unit-local view of a flat map: every entry under `"<unit>."`.
pub fn unit_view(flat: &HashMap<Rc<str>, Array>, unit: &str) -> UnitParams {
    let prefix = format!("{unit}.");
    flat.iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix.as_str()).map(|local| (Rc::from(local), v.clone())))
        .collect()
}

/// Group a flat map by unit.
pub fn group_by_unit(flat: &HashMap<Rc<str>, Array>) -> BTreeMap<String, UnitParams> {
    let mut grouped: BTreeMap<String, UnitParams> = BTreeMap::new();
    for (key, value) in flat {
        if let Some((unit, local)) = split_key(key) {
            grouped
                .entry(unit.to_string())
                .or_default()
                .insert(Rc::from(local), value.clone());
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceModelBuilder;

    #[test]
    fn test_key_helpers() {
        assert_eq!(&*global_key("predictor", "lstm.weight"), "predictor.lstm.weight");
        assert_eq!(split_key("predictor.lstm.weight"), Some(("predictor", "lstm.weight")));
    }

    #[test]
    fn test_reference_registry_is_complete() {
        let registry = ReferenceModelBuilder::tiny().build(0);
        assert!(registry.missing_roles().is_empty());
        assert!(!registry.trainable_names().contains(&names::SLM.to_string()));
    }

    #[test]
    fn test_flat_and_grouped_views_agree() {
        let registry = ReferenceModelBuilder::tiny().build(0);
        let flat = registry
            .flat_parameters(&[names::PREDICTOR, names::DECODER])
            .unwrap();
        let grouped = group_by_unit(&flat);
        assert_eq!(grouped.len(), 2);
        let view = unit_view(&flat, names::PREDICTOR);
        assert_eq!(view.len(), registry.get(names::PREDICTOR).unwrap().parameters().len());
        assert!(view.contains_key("duration_proj.weight"));
    }

    #[test]
    fn test_copy_unit_is_deep() {
        let mut registry = ReferenceModelBuilder::tiny().build(0);
        registry
            .copy_unit(names::STYLE_ENCODER, names::PREDICTOR_ENCODER)
            .unwrap();
        let mut zeroed = registry.get(names::PREDICTOR_ENCODER).unwrap().parameters().clone();
        for v in zeroed.values_mut() {
            *v = mlx_rs::ops::zeros_like(v).unwrap();
        }
        registry
            .set_unit_parameters(names::PREDICTOR_ENCODER, zeroed)
            .unwrap();
        let style = registry.get(names::STYLE_ENCODER).unwrap().parameters();
        let w = style.get("proj.weight").unwrap();
        w.eval().unwrap();
        assert!(w.abs().unwrap().sum(None).unwrap().item::<f32>() > 0.0);
    }

    #[test]
    fn test_caller_overrides_only_listed_units() {
        let registry = ReferenceModelBuilder::tiny().build(0);
        let mut flat = registry.flat_parameters(&[names::WD]).unwrap();
        for v in flat.values_mut() {
            *v = mlx_rs::ops::zeros_like(v).unwrap();
        }
        let caller = UnitCaller::with_flat(&registry, &flat);
        let wd = caller.params(names::WD).unwrap();
        let w = wd.get("weight").unwrap();
        assert_eq!(w.abs().unwrap().sum(None).unwrap().item::<f32>(), 0.0);
        assert_eq!(
            caller.params(names::MPD).unwrap().len(),
            registry.get(names::MPD).unwrap().parameters().len()
        );
    }

    #[test]
    fn test_unknown_unit() {
        let registry = ModelRegistry::new();
        assert!(matches!(registry.get("nope"), Err(TrainerError::UnknownUnit(_))));
    }
}
