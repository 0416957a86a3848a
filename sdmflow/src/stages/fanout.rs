//! Fan-out formulas and inclusion predicates.

use crate::config::ParameterSet;
use crate::core::DynamicCounts;
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

/// One factor of a fan-out product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountFactor {
    /// Entities in the batch (E).
    Entities,
    /// Modeling algorithms (A).
    Algorithms,
    /// Nesting methods (M).
    NestingMethods,
    /// Climate scenarios (S).
    Scenarios,
    /// Projection periods (P).
    Periods,
    /// Simulation combinations (C).
    SimulationCombinations,
}

impl CountFactor {
    /// Reads this factor from the counts.
    #[must_use]
    pub fn value(self, counts: &DynamicCounts) -> u32 {
        match self {
            Self::Entities => counts.entities,
            Self::Algorithms => counts.algorithms,
            Self::NestingMethods => counts.nesting_methods,
            Self::Scenarios => counts.scenarios,
            Self::Periods => counts.periods,
            Self::SimulationCombinations => counts.simulation_combinations,
        }
    }

    /// The single-letter symbol used in plans and logs.
    #[must_use]
    pub fn symbol(self) -> char {
        match self {
            Self::Entities => 'E',
            Self::Algorithms => 'A',
            Self::NestingMethods => 'M',
            Self::Scenarios => 'S',
            Self::Periods => 'P',
            Self::SimulationCombinations => 'C',
        }
    }
}

/// A stage's array size as a product of counts.
///
/// The empty product is a scalar (single-task) stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FanOut {
    factors: Vec<CountFactor>,
}

impl FanOut {
    /// A single task.
    #[must_use]
    pub fn scalar() -> Self {
        Self {
            factors: Vec::new(),
        }
    }

    /// The product of the given factors.
    #[must_use]
    pub fn product(factors: &[CountFactor]) -> Self {
        Self {
            factors: factors.to_vec(),
        }
    }

    /// The factors of this formula.
    #[must_use]
    pub fn factors(&self) -> &[CountFactor] {
        &self.factors
    }

    /// Returns true for a single-task stage.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.factors.is_empty()
    }

    /// Evaluates the formula.
    ///
    /// # Errors
    ///
    /// Returns an error if a factor is zero or the product overflows.
    pub fn evaluate(&self, counts: &DynamicCounts) -> Result<NonZeroU32, ConfigurationError> {
        let mut extent: u32 = 1;
        for factor in &self.factors {
            extent = extent.checked_mul(factor.value(counts)).ok_or_else(|| {
                ConfigurationError::new(format!("fan-out {self} overflows for {counts:?}"))
            })?;
        }
        NonZeroU32::new(extent).ok_or_else(|| {
            ConfigurationError::new(format!("fan-out {self} evaluated to 0 for {counts:?}"))
        })
    }
}

impl fmt::Display for FanOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factors.is_empty() {
            return write!(f, "1");
        }
        let symbols: Vec<String> = self.factors.iter().map(|x| x.symbol().to_string()).collect();
        write!(f, "{}", symbols.join(" x "))
    }
}

/// The run-level switches that gate the optional sub-graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineToggles {
    /// Number of analysis levels (`n_levels`).
    pub levels: u32,
    /// Whether future projections run (`do_proj`).
    pub projections: bool,
}

impl PipelineToggles {
    /// Reads `n_levels` and `do_proj`.
    ///
    /// # Errors
    ///
    /// Returns an error if either setting is missing or malformed.
    pub fn from_params(params: &ParameterSet) -> Result<Self, ConfigurationError> {
        let levels = params.require_u32("n_levels")?;
        if levels == 0 {
            return Err(ConfigurationError::invalid("n_levels", "must be at least 1"));
        }
        Ok(Self {
            levels,
            projections: params.require_flag("do_proj")?,
        })
    }

    /// Returns true when the regional level is analysed.
    #[must_use]
    pub fn multi_level(&self) -> bool {
        self.levels > 1
    }
}

/// When a stage belongs to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inclusion {
    /// Always runs.
    Always,
    /// Runs when more than one analysis level is configured.
    MultiLevel,
    /// Runs when projections are enabled.
    Projections,
    /// Runs when both of the above hold.
    MultiLevelProjections,
}

impl Inclusion {
    /// Evaluates the predicate.
    #[must_use]
    pub fn includes(self, toggles: &PipelineToggles) -> bool {
        match self {
            Self::Always => true,
            Self::MultiLevel => toggles.multi_level(),
            Self::Projections => toggles.projections,
            Self::MultiLevelProjections => toggles.multi_level() && toggles.projections,
        }
    }
}
