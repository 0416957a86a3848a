//! Dynamic count resolution.

use crate::config::ParameterSet;
use crate::core::DynamicCounts;
use crate::errors::ConfigurationError;
use crate::session::{read_combinations, SessionContext, SessionLayout};
use crate::stages::PipelineToggles;
use tracing::debug;

/// Computes the counts the fan-out formulas are evaluated on.
///
/// List lengths come from the settings and the combination count from the
/// session; both are fixed for the run. The entity count is read from the
/// batch entity list on every call to [`CountResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountResolver {
    algorithms: u32,
    nesting_methods: u32,
    scenarios: u32,
    periods: u32,
    simulation_combinations: u32,
}

impl CountResolver {
    /// Reads the run-level counts.
    ///
    /// A list only consumed by a sub-graph that is switched off may be
    /// absent; its count is then 1.
    ///
    /// # Errors
    ///
    /// Returns an error if a required list is missing or empty.
    pub fn new(
        params: &ParameterSet,
        toggles: &PipelineToggles,
        session: &SessionContext,
    ) -> Result<Self, ConfigurationError> {
        let algorithms = list_len(params, "algorithms", true)?;
        let nesting_methods = list_len(params, "nesting_methods", toggles.multi_level())?;
        let scenarios = list_len(params, "scenarios", toggles.projections)?;
        let periods = list_len(params, "periods", toggles.projections)?;
        let simulation_combinations = combination_count(
            session,
            toggles.projections && toggles.multi_level(),
        )?;

        Ok(Self {
            algorithms,
            nesting_methods,
            scenarios,
            periods,
            simulation_combinations,
        })
    }

    /// Counts for the batch whose entity list is currently on scratch.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity list is missing or empty, or disagrees
    /// with the entity count file.
    pub fn resolve(&self, layout: &SessionLayout) -> Result<DynamicCounts, ConfigurationError> {
        let list_path = layout.entity_list();
        let content = std::fs::read_to_string(&list_path).map_err(|e| {
            ConfigurationError::new(format!(
                "cannot read entity list {}: {e}",
                list_path.display()
            ))
        })?;
        let entities = u32::try_from(content.lines().filter(|l| !l.trim().is_empty()).count())
            .map_err(|_| ConfigurationError::new("entity list is too long"))?;

        if let Ok(raw) = std::fs::read_to_string(layout.entity_count()) {
            let declared: u32 = raw.trim().parse().map_err(|_| {
                ConfigurationError::new(format!("entity count file holds '{}'", raw.trim()))
            })?;
            if declared != entities {
                return Err(ConfigurationError::new(format!(
                    "entity count file says {declared} but the entity list has {entities}"
                )));
            }
        }

        let counts = self.counts_for(entities)?;
        debug!(?counts, "Resolved batch counts");
        Ok(counts)
    }

    /// Counts for a batch of `entities` entities.
    ///
    /// # Errors
    ///
    /// Returns an error if `entities` is zero.
    pub fn counts_for(&self, entities: u32) -> Result<DynamicCounts, ConfigurationError> {
        DynamicCounts::new(
            entities,
            self.algorithms,
            self.nesting_methods,
            self.scenarios,
            self.periods,
            self.simulation_combinations,
        )
    }
}

fn list_len(params: &ParameterSet, key: &str, required: bool) -> Result<u32, ConfigurationError> {
    let items = if required {
        params.require_list(key)?
    } else {
        match params.optional_list(key)? {
            Some(items) if !items.is_empty() => items,
            _ => return Ok(1),
        }
    };
    if items.is_empty() {
        return Err(ConfigurationError::invalid(key, "list must not be empty"));
    }
    u32::try_from(items.len()).map_err(|_| ConfigurationError::invalid(key, "list is too long"))
}

fn combination_count(session: &SessionContext, required: bool) -> Result<u32, ConfigurationError> {
    let mut combinations = session.combinations().len();
    if combinations == 0 {
        combinations = read_combinations(&session.layout().combinations_file())
            .map(|c| c.len())
            .unwrap_or(0);
    }
    match (combinations, required) {
        (0, true) => Err(ConfigurationError::missing("simulation.control_table")),
        (0, false) => Ok(1),
        (n, _) => u32::try_from(n)
            .map_err(|_| ConfigurationError::new("too many simulation combinations")),
    }
}
