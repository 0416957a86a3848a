//! Per-batch counts that feed the stage fan-out formulas.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};

/// The scalar counts a batch's fan-out extents are computed from.
///
/// Every field is at least one; [`DynamicCounts::new`] rejects zeros so that
/// no formula over these counts can produce an empty array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynamicCounts {
    /// Entities (species) in the current batch.
    pub entities: u32,
    /// Modeling algorithms.
    pub algorithms: u32,
    /// Nesting methods used at the regional level.
    pub nesting_methods: u32,
    /// Future climate scenarios.
    pub scenarios: u32,
    /// Projection periods.
    pub periods: u32,
    /// Lines of the simulation-combination file.
    pub simulation_combinations: u32,
}

impl DynamicCounts {
    /// Creates validated counts.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` naming the first count that is zero.
    pub fn new(
        entities: u32,
        algorithms: u32,
        nesting_methods: u32,
        scenarios: u32,
        periods: u32,
        simulation_combinations: u32,
    ) -> Result<Self, ConfigurationError> {
        let counts = Self {
            entities,
            algorithms,
            nesting_methods,
            scenarios,
            periods,
            simulation_combinations,
        };
        counts.validate()?;
        Ok(counts)
    }

    /// Checks that no count is zero.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` naming the first zero count.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let fields = [
            ("entities", self.entities),
            ("algorithms", self.algorithms),
            ("nesting_methods", self.nesting_methods),
            ("scenarios", self.scenarios),
            ("periods", self.periods),
            ("simulation_combinations", self.simulation_combinations),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ConfigurationError::invalid(
                    name,
                    "count must be at least 1; a stage cannot fan out over nothing",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accept_positive_values() {
        let counts = DynamicCounts::new(12, 4, 3, 2, 2, 6).unwrap();
        assert_eq!(counts.entities, 12);
        assert_eq!(counts.simulation_combinations, 6);
    }

    #[test]
    fn test_counts_reject_zero() {
        let err = DynamicCounts::new(12, 0, 3, 2, 2, 6).unwrap_err();
        assert_eq!(err.key.as_deref(), Some("algorithms"));

        let err = DynamicCounts::new(0, 1, 1, 1, 1, 1).unwrap_err();
        assert_eq!(err.key.as_deref(), Some("entities"));
    }
}
