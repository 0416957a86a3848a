//! Per-batch execution plans.

use crate::config::{ParameterSet, ResourceProfile};
use crate::core::DynamicCounts;
use crate::errors::ConfigurationError;
use crate::session::SessionContext;
use crate::stages::{FanOut, PipelineToggles, StageCatalog};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;

/// One stage as it will be submitted in this batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    /// Position in the catalog.
    pub catalog_index: usize,
    /// Stage name.
    pub name: String,
    /// The formula the extent came from.
    pub fan_out: FanOut,
    /// Number of tasks.
    pub extent: NonZeroU32,
    /// Resources after overrides.
    pub profile: ResourceProfile,
    /// Work unit.
    pub command: PathBuf,
    /// Stage log directory.
    pub log_dir: PathBuf,
}

/// The included stages of one batch, in order, with their extents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    counts: DynamicCounts,
    stages: Vec<PlannedStage>,
    skipped: Vec<String>,
}

impl ExecutionPlan {
    /// Plans a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is malformed, an included stage depends
    /// on an excluded one, or an extent overflows.
    pub fn build(
        catalog: &StageCatalog,
        params: &ParameterSet,
        toggles: &PipelineToggles,
        counts: &DynamicCounts,
        session: &SessionContext,
    ) -> Result<Self, ConfigurationError> {
        let included = catalog.inclusion_map(toggles, params)?;
        let mut stages = Vec::new();
        let mut skipped = Vec::new();

        for (catalog_index, descriptor) in catalog.iter().enumerate() {
            if !included.get(&descriptor.name).copied().unwrap_or(false) {
                skipped.push(descriptor.name.clone());
                continue;
            }

            let extent = descriptor.fan_out.evaluate(counts).map_err(|e| {
                ConfigurationError::new(format!("stage '{}': {}", descriptor.name, e.message))
            })?;
            let profile = descriptor
                .profile
                .clone()
                .with_overrides(params, &descriptor.name)?;
            let command = params
                .optional_path(&format!("stages.{}.command", descriptor.name))?
                .unwrap_or_else(|| {
                    session
                        .pipeline_dir()
                        .join(format!("{}.sh", descriptor.name))
                });

            stages.push(PlannedStage {
                catalog_index,
                name: descriptor.name.clone(),
                fan_out: descriptor.fan_out.clone(),
                extent,
                profile,
                command,
                log_dir: session.layout().stage_log_dir(&descriptor.name),
            });
        }

        Ok(Self {
            counts: *counts,
            stages,
            skipped,
        })
    }

    /// Included stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    /// Names of the excluded stages.
    #[must_use]
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// The counts the plan was computed from.
    #[must_use]
    pub fn counts(&self) -> &DynamicCounts {
        &self.counts
    }

    /// Looks up a planned stage.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PlannedStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Total tasks across all stages.
    #[must_use]
    pub fn total_tasks(&self) -> u64 {
        self.stages.iter().map(|s| u64::from(s.extent.get())).sum()
    }

    /// Number of included stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage is included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<27} {:>8}  {:<11} {:>6} {:>12} {:>4}",
            "stage", "tasks", "formula", "mem", "time", "cpus"
        )?;
        for stage in &self.stages {
            writeln!(
                f,
                "{:<27} {:>8}  {:<11} {:>6} {:>12} {:>4}",
                stage.name,
                stage.extent,
                stage.fan_out.to_string(),
                stage.profile.memory_per_core,
                stage.profile.wall_time.to_string(),
                stage.profile.cores
            )?;
        }
        for name in &self.skipped {
            writeln!(f, "{name:<27} {:>8}", "skipped")?;
        }
        write!(f, "total tasks: {}", self.total_tasks())
    }
}
