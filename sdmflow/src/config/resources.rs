//! Scheduler resource profiles.

use super::ParameterSet;
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A wall-time limit, stored in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallTime(u64);

impl WallTime {
    /// Creates a wall time from seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Creates a wall time from hours.
    #[must_use]
    pub const fn from_hours(hours: u64) -> Self {
        Self(hours * 3_600)
    }

    /// Returns the limit in seconds.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0
    }
}

impl FromStr for WallTime {
    type Err = ConfigurationError;

    /// Parses the Slurm time formats: `MM`, `MM:SS`, `HH:MM:SS`, `D-HH`,
    /// `D-HH:MM` and `D-HH:MM:SS`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::new(format!("'{s}' is not a valid wall time"));
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let parse = |part: &str| part.parse::<u64>().map_err(|_| invalid());

        let (days, rest) = match trimmed.split_once('-') {
            Some((d, rest)) => (parse(d)?, Some(rest)),
            None => (0, None),
        };

        let (hours, minutes, secs) = match rest {
            Some(rest) => {
                let parts: Vec<&str> = rest.split(':').collect();
                match parts.as_slice() {
                    [h] => (parse(h)?, 0, 0),
                    [h, m] => (parse(h)?, parse(m)?, 0),
                    [h, m, sec] => (parse(h)?, parse(m)?, parse(sec)?),
                    _ => return Err(invalid()),
                }
            }
            None => {
                let parts: Vec<&str> = trimmed.split(':').collect();
                match parts.as_slice() {
                    [m] => (0, parse(m)?, 0),
                    [m, sec] => (0, parse(m)?, parse(sec)?),
                    [h, m, sec] => (parse(h)?, parse(m)?, parse(sec)?),
                    _ => return Err(invalid()),
                }
            }
        };

        let total = days
            .checked_mul(86_400)
            .and_then(|t| t.checked_add(hours.checked_mul(3_600)?))
            .and_then(|t| t.checked_add(minutes.checked_mul(60)?))
            .and_then(|t| t.checked_add(secs))
            .ok_or_else(invalid)?;
        if total == 0 {
            return Err(invalid());
        }
        Ok(Self(total))
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::utils::format_elapsed(std::time::Duration::from_secs(self.0)))
    }
}

/// Memory, time and core request for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Memory per core in Slurm notation (`4G`, `500M`).
    pub memory_per_core: String,
    /// Wall-time limit per task.
    pub wall_time: WallTime,
    /// Cores per task.
    pub cores: u32,
}

impl ResourceProfile {
    /// Creates a resource profile.
    #[must_use]
    pub fn new(memory_per_core: impl Into<String>, wall_time: WallTime, cores: u32) -> Self {
        Self {
            memory_per_core: memory_per_core.into(),
            wall_time,
            cores,
        }
    }

    /// Applies `resources.<stage>.{mem,time,cpus}` overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is malformed.
    pub fn with_overrides(
        mut self,
        params: &ParameterSet,
        stage: &str,
    ) -> Result<Self, ConfigurationError> {
        let mem_key = format!("resources.{stage}.mem");
        if let Some(mem) = params.optional_str(&mem_key)? {
            self.memory_per_core = mem.trim().to_string();
        }

        let time_key = format!("resources.{stage}.time");
        if let Some(time) = params.optional_str(&time_key)? {
            self.wall_time = time
                .parse()
                .map_err(|e: ConfigurationError| ConfigurationError::invalid(&time_key, e.message))?;
        }

        let cpus_key = format!("resources.{stage}.cpus");
        if let Some(cpus) = params.optional_u32(&cpus_key)? {
            self.cores = cpus;
        }

        self.validate().map_err(|e| match e.key {
            Some(_) => e,
            None => ConfigurationError::invalid(format!("resources.{stage}"), e.message),
        })?;
        Ok(self)
    }

    /// Checks the memory notation and core count.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be submitted.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let digits = self
            .memory_per_core
            .strip_suffix(['K', 'M', 'G', 'T'])
            .unwrap_or(&self.memory_per_core);
        let well_formed = !digits.is_empty()
            && !digits.starts_with('0')
            && digits.bytes().all(|b| b.is_ascii_digit());

        if !well_formed {
            return Err(ConfigurationError::new(format!(
                "memory '{}' is not in Slurm notation (e.g. 4G)",
                self.memory_per_core
            )));
        }
        if self.cores == 0 {
            return Err(ConfigurationError::new("core count must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_time_formats() {
        assert_eq!("30".parse::<WallTime>().unwrap().as_secs(), 1_800);
        assert_eq!("02:00:00".parse::<WallTime>().unwrap().as_secs(), 7_200);
        assert_eq!("1-12".parse::<WallTime>().unwrap().as_secs(), 129_600);
        assert_eq!("2-00:30:00".parse::<WallTime>().unwrap().as_secs(), 174_600);
        assert!("".parse::<WallTime>().is_err());
        assert!("0".parse::<WallTime>().is_err());
        assert!("1:2:3:4".parse::<WallTime>().is_err());
    }

    #[test]
    fn test_wall_time_overflow_is_rejected() {
        assert!("99999999999999999:00:00".parse::<WallTime>().is_err());
        assert!("999999999999999-00".parse::<WallTime>().is_err());
        assert!("18446744073709551615".parse::<WallTime>().is_err());
    }

    #[test]
    fn test_wall_time_display() {
        assert_eq!(WallTime::from_hours(2).to_string(), "02:00:00");
        assert_eq!(WallTime::from_hours(30).to_string(), "1-06:00:00");
    }

    #[test]
    fn test_overrides() {
        let params = ParameterSet::from_toml(
            r#"
            [resources.global_fit]
            mem = "16G"
            time = "1-00:00:00"
            cpus = 4
            "#,
        )
        .unwrap();

        let base = ResourceProfile::new("4G", WallTime::from_hours(2), 1);
        let fit = base.clone().with_overrides(&params, "global_fit").unwrap();
        assert_eq!(fit.memory_per_core, "16G");
        assert_eq!(fit.wall_time, WallTime::from_hours(24));
        assert_eq!(fit.cores, 4);

        let untouched = base.clone().with_overrides(&params, "evaluate").unwrap();
        assert_eq!(untouched, base);
    }

    #[test]
    fn test_bad_override_names_key() {
        let params = ParameterSet::from_toml("[resources.prepare]\ntime = \"soon\"\n").unwrap();
        let err = ResourceProfile::new("4G", WallTime::from_hours(1), 1)
            .with_overrides(&params, "prepare")
            .unwrap_err();
        assert_eq!(err.key.as_deref(), Some("resources.prepare.time"));

        let params = ParameterSet::from_toml("[resources.prepare]\nmem = \"lots\"\n").unwrap();
        let err = ResourceProfile::new("4G", WallTime::from_hours(1), 1)
            .with_overrides(&params, "prepare")
            .unwrap_err();
        assert_eq!(err.key.as_deref(), Some("resources.prepare"));
    }
}
