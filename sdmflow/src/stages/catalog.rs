//! The stage descriptor catalog.

use super::fanout::{CountFactor, FanOut, Inclusion, PipelineToggles};
use crate::config::{ParameterSet, ResourceProfile, WallTime};
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static description of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique stage name; also the default work-unit and log directory name.
    pub name: String,
    /// Default resources, overridable per run.
    pub profile: ResourceProfile,
    /// Array size formula.
    pub fan_out: FanOut,
    /// When the stage belongs to the pipeline.
    pub inclusion: Inclusion,
    /// The stage that must complete first.
    pub after: Option<String>,
}

impl StageDescriptor {
    /// Creates an always-included scalar stage.
    #[must_use]
    pub fn new(name: impl Into<String>, profile: ResourceProfile) -> Self {
        Self {
            name: name.into(),
            profile,
            fan_out: FanOut::scalar(),
            inclusion: Inclusion::Always,
            after: None,
        }
    }

    /// Sets the fan-out formula.
    #[must_use]
    pub fn with_fan_out(mut self, factors: &[CountFactor]) -> Self {
        self.fan_out = FanOut::product(factors);
        self
    }

    /// Sets the inclusion predicate.
    #[must_use]
    pub fn with_inclusion(mut self, inclusion: Inclusion) -> Self {
        self.inclusion = inclusion;
        self
    }

    /// Sets the predecessor.
    #[must_use]
    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.after = Some(predecessor.into());
        self
    }

    /// Returns true if the stage runs under these settings.
    ///
    /// Combines the inclusion predicate with the operator switch
    /// `stages.<name>.enabled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the switch is malformed.
    pub fn is_included(
        &self,
        toggles: &PipelineToggles,
        params: &ParameterSet,
    ) -> Result<bool, ConfigurationError> {
        let enabled = params.flag(&format!("stages.{}.enabled", self.name), true)?;
        Ok(enabled && self.inclusion.includes(toggles))
    }
}

/// Ordered, validated list of stages.
///
/// Declaration order is execution order. Every predecessor is declared
/// before the stages that depend on it, which rules out cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCatalog {
    stages: Vec<StageDescriptor>,
}

impl StageCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the predecessor has not been
    /// declared yet.
    pub fn stage(mut self, descriptor: StageDescriptor) -> Result<Self, ConfigurationError> {
        if descriptor.name.is_empty() {
            return Err(ConfigurationError::new("stage name must not be empty"));
        }
        if self.get(&descriptor.name).is_some() {
            return Err(ConfigurationError::new(format!(
                "stage '{}' is declared twice",
                descriptor.name
            )));
        }
        if let Some(after) = &descriptor.after {
            if self.get(after).is_none() {
                return Err(ConfigurationError::new(format!(
                    "stage '{}' runs after '{after}', which is not declared before it",
                    descriptor.name
                )));
            }
        }
        self.stages.push(descriptor);
        Ok(self)
    }

    /// The standard species-distribution pipeline.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in table; the `Result` comes from the
    /// validating constructor.
    pub fn standard() -> Result<Self, ConfigurationError> {
        use CountFactor::{Algorithms, Entities, NestingMethods, Scenarios, SimulationCombinations};

        let light = ResourceProfile::new("4G", WallTime::from_hours(2), 1);
        let fit = ResourceProfile::new("8G", WallTime::from_hours(12), 1);
        let regional_fit = ResourceProfile::new("8G", WallTime::from_hours(24), 1);
        let ensemble = ResourceProfile::new("8G", WallTime::from_hours(4), 1);
        let predict = ResourceProfile::new("16G", WallTime::from_hours(12), 1);

        Self::new()
            .stage(StageDescriptor::new("prepare", light.clone()))?
            .stage(
                StageDescriptor::new("global_covsel", light.clone())
                    .with_fan_out(&[Entities])
                    .after("prepare"),
            )?
            .stage(
                StageDescriptor::new("global_fit", fit.clone())
                    .with_fan_out(&[Entities, Algorithms])
                    .after("global_covsel"),
            )?
            .stage(
                StageDescriptor::new("global_ensemble", ensemble.clone())
                    .with_fan_out(&[Entities])
                    .after("global_fit"),
            )?
            .stage(
                StageDescriptor::new("regional_covsel", light.clone())
                    .with_fan_out(&[Entities])
                    .with_inclusion(Inclusion::MultiLevel)
                    .after("global_ensemble"),
            )?
            .stage(
                StageDescriptor::new("regional_fit", regional_fit)
                    .with_fan_out(&[Entities, Algorithms, NestingMethods])
                    .with_inclusion(Inclusion::MultiLevel)
                    .after("regional_covsel"),
            )?
            .stage(
                StageDescriptor::new("regional_ensemble", ensemble.clone())
                    .with_fan_out(&[Entities, NestingMethods])
                    .with_inclusion(Inclusion::MultiLevel)
                    .after("regional_fit"),
            )?
            .stage(
                StageDescriptor::new("global_predict", predict.clone())
                    .with_fan_out(&[Entities, Scenarios])
                    .with_inclusion(Inclusion::Projections)
                    .after("global_ensemble"),
            )?
            .stage(
                StageDescriptor::new("global_predict_ensemble", ensemble.clone())
                    .with_fan_out(&[Entities])
                    .with_inclusion(Inclusion::Projections)
                    .after("global_predict"),
            )?
            .stage(
                StageDescriptor::new("regional_predict", predict)
                    .with_fan_out(&[Entities, NestingMethods, SimulationCombinations])
                    .with_inclusion(Inclusion::MultiLevelProjections)
                    .after("regional_ensemble"),
            )?
            .stage(
                StageDescriptor::new("regional_predict_ensemble", ensemble)
                    .with_fan_out(&[Entities, NestingMethods])
                    .with_inclusion(Inclusion::MultiLevelProjections)
                    .after("regional_predict"),
            )?
            .stage(
                StageDescriptor::new("evaluate", light)
                    .with_fan_out(&[Entities])
                    .after("global_ensemble"),
            )
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Position of a stage in execution order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Stages in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter()
    }

    /// Number of declared stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Evaluates inclusion for every stage.
    ///
    /// # Errors
    ///
    /// Returns an error if a switch is malformed or an included stage would
    /// run after an excluded one.
    pub fn inclusion_map(
        &self,
        toggles: &PipelineToggles,
        params: &ParameterSet,
    ) -> Result<HashMap<String, bool>, ConfigurationError> {
        let mut included = HashMap::with_capacity(self.stages.len());
        for stage in &self.stages {
            let runs = stage.is_included(toggles, params)?;
            if runs {
                if let Some(after) = &stage.after {
                    if !included.get(after).copied().unwrap_or(false) {
                        return Err(ConfigurationError::invalid(
                            format!("stages.{after}.enabled"),
                            format!("stage '{}' needs '{after}', which is excluded", stage.name),
                        ));
                    }
                }
            }
            included.insert(stage.name.clone(), runs);
        }
        Ok(included)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn toggles(levels: u32, projections: bool) -> PipelineToggles {
        PipelineToggles {
            levels,
            projections,
        }
    }

    fn included(catalog: &StageCatalog, t: PipelineToggles, params: &ParameterSet) -> Vec<String> {
        let map = catalog.inclusion_map(&t, params).unwrap();
        catalog
            .iter()
            .filter(|s| map[&s.name])
            .map(|s| s.name.clone())
            .collect()
    }

    #[test]
    fn test_standard_catalog_order() {
        let catalog = StageCatalog::standard().unwrap();
        assert_eq!(catalog.len(), 12);
        assert_eq!(catalog.position("prepare"), Some(0));
        assert_eq!(catalog.position("evaluate"), Some(11));
        assert_eq!(
            catalog.get("regional_predict").unwrap().fan_out.to_string(),
            "E x M x C"
        );
        assert!(catalog.get("prepare").unwrap().fan_out.is_scalar());
    }

    #[test]
    fn test_single_level_with_projections() {
        let catalog = StageCatalog::standard().unwrap();
        let names = included(&catalog, toggles(1, true), &ParameterSet::default());
        assert_eq!(
            names,
            vec![
                "prepare",
                "global_covsel",
                "global_fit",
                "global_ensemble",
                "global_predict",
                "global_predict_ensemble",
                "evaluate",
            ]
        );
    }

    #[test]
    fn test_multi_level_without_projections() {
        let catalog = StageCatalog::standard().unwrap();
        let names = included(&catalog, toggles(2, false), &ParameterSet::default());
        assert!(names.contains(&"regional_fit".to_string()));
        assert!(!names.iter().any(|n| n.contains("predict")));
    }

    #[test]
    fn test_disabled_leaf_stage() {
        let catalog = StageCatalog::standard().unwrap();
        let params = ParameterSet::from_toml("[stages.evaluate]\nenabled = false\n").unwrap();
        let names = included(&catalog, toggles(1, false), &params);
        assert_eq!(names.last().map(String::as_str), Some("global_ensemble"));
    }

    #[test]
    fn test_disabled_predecessor_is_rejected() {
        let catalog = StageCatalog::standard().unwrap();
        let params = ParameterSet::from_toml("[stages.global_fit]\nenabled = false\n").unwrap();
        let err = catalog
            .inclusion_map(&toggles(1, false), &params)
            .unwrap_err();
        assert_eq!(err.key.as_deref(), Some("stages.global_fit.enabled"));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let profile = ResourceProfile::new("1G", WallTime::from_hours(1), 1);
        let result = StageCatalog::new()
            .stage(StageDescriptor::new("a", profile.clone()))
            .and_then(|c| c.stage(StageDescriptor::new("a", profile)));
        assert!(result.is_err());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let profile = ResourceProfile::new("1G", WallTime::from_hours(1), 1);
        let result = StageCatalog::new().stage(StageDescriptor::new("b", profile).after("a"));
        assert!(result.is_err());
    }
}
