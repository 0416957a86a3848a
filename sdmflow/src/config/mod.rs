//! Run configuration.
//!
//! A run is configured by one flat TOML document loaded into an immutable
//! [`ParameterSet`]. Keys may be written as nested tables or as dotted keys;
//! lookups always use the dotted form (`paths.scratch`).

mod resources;

pub use resources::{ResourceProfile, WallTime};

use crate::errors::ConfigurationError;
use std::path::{Path, PathBuf};

/// Immutable key/value settings for one run.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    table: toml::Table,
    source: Option<PathBuf>,
}

impl ParameterSet {
    /// Loads a parameter set from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        let mut params = Self::from_toml(&content)?;
        params.source = Some(path.to_path_buf());
        Ok(params)
    }

    /// Parses a parameter set from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        let table = content
            .parse::<toml::Table>()
            .map_err(|e| ConfigurationError::new(format!("invalid settings: {e}")))?;
        Ok(Self::from_table(table))
    }

    /// Wraps an already parsed table.
    #[must_use]
    pub fn from_table(table: toml::Table) -> Self {
        Self {
            table,
            source: None,
        }
    }

    /// The file the settings were loaded from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Looks up a raw value by dotted key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        if let Some(value) = self.table.get(key) {
            return Some(value);
        }
        let mut segments = key.split('.');
        let mut current = self.table.get(segments.next()?)?;
        for segment in segments {
            current = current.as_table()?.get(segment)?;
        }
        Some(current)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns a required string setting.
    pub fn require_str(&self, key: &str) -> Result<&str, ConfigurationError> {
        self.optional_str(key)?
            .ok_or_else(|| ConfigurationError::missing(key))
    }

    /// Returns an optional string setting.
    pub fn optional_str(&self, key: &str) -> Result<Option<&str>, ConfigurationError> {
        match self.get(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(type_error(key, "a string", other)),
        }
    }

    /// Returns a required path setting.
    pub fn require_path(&self, key: &str) -> Result<PathBuf, ConfigurationError> {
        self.require_str(key).map(PathBuf::from)
    }

    /// Returns an optional path setting.
    pub fn optional_path(&self, key: &str) -> Result<Option<PathBuf>, ConfigurationError> {
        Ok(self.optional_str(key)?.map(PathBuf::from))
    }

    /// Returns a required non-negative integer setting.
    pub fn require_u32(&self, key: &str) -> Result<u32, ConfigurationError> {
        self.optional_u32(key)?
            .ok_or_else(|| ConfigurationError::missing(key))
    }

    /// Returns an optional non-negative integer setting.
    ///
    /// Integers written as strings (`"3"`) are accepted.
    pub fn optional_u32(&self, key: &str) -> Result<Option<u32>, ConfigurationError> {
        match self.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(n)) => u32::try_from(*n)
                .map(Some)
                .map_err(|_| ConfigurationError::invalid(key, format!("{n} is out of range"))),
            Some(toml::Value::String(s)) => s
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| ConfigurationError::invalid(key, format!("'{s}' is not a count"))),
            Some(other) => Err(type_error(key, "an integer", other)),
        }
    }

    /// Returns a required boolean flag.
    pub fn require_flag(&self, key: &str) -> Result<bool, ConfigurationError> {
        self.optional_flag(key)?
            .ok_or_else(|| ConfigurationError::missing(key))
    }

    /// Returns a boolean flag, or `default` when absent.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigurationError> {
        Ok(self.optional_flag(key)?.unwrap_or(default))
    }

    /// Returns an optional boolean flag.
    ///
    /// Besides TOML booleans, `0`/`1` and the strings `true`, `false`, `yes`,
    /// `no` (any case) are accepted, since many settings tables are
    /// produced by other tools.
    pub fn optional_flag(&self, key: &str) -> Result<Option<bool>, ConfigurationError> {
        match self.get(key) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
            Some(toml::Value::Integer(0)) => Ok(Some(false)),
            Some(toml::Value::Integer(1)) => Ok(Some(true)),
            Some(toml::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(ConfigurationError::invalid(key, format!("'{s}' is not a boolean"))),
            },
            Some(other) => Err(type_error(key, "a boolean", other)),
        }
    }

    /// Returns a required list of strings.
    pub fn require_list(&self, key: &str) -> Result<Vec<String>, ConfigurationError> {
        self.optional_list(key)?
            .ok_or_else(|| ConfigurationError::missing(key))
    }

    /// Returns an optional list of strings.
    pub fn optional_list(&self, key: &str) -> Result<Option<Vec<String>>, ConfigurationError> {
        match self.get(key) {
            None => Ok(None),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s.clone()),
                    other => Err(type_error(key, "a list of strings", other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(type_error(key, "a list of strings", other)),
        }
    }

    /// Returns a list that may also be written as one delimited string.
    ///
    /// `"tmp/,*.aux.xml"` and `["tmp/", "*.aux.xml"]` are equivalent.
    /// Items are trimmed and empty items dropped.
    pub fn delimited_list(
        &self,
        key: &str,
        delimiter: char,
    ) -> Result<Vec<String>, ConfigurationError> {
        let raw = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(toml::Value::String(s)) => s.split(delimiter).map(str::to_string).collect(),
            Some(_) => self.require_list(key)?,
        };
        Ok(raw
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect())
    }
}

fn type_error(key: &str, expected: &str, found: &toml::Value) -> ConfigurationError {
    ConfigurationError::invalid(key, format!("expected {expected}, found {}", found.type_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SETTINGS: &str = r#"
        algorithms = ["glm", "gam", "rf", "maxent"]
        n_levels = 2
        do_proj = "TRUE"
        "paths.scratch" = "/scratch/run"

        [paths]
        durable = "/project/run"

        [sync]
        exclude = "tmp/, *.aux.xml ,,"
    "#;

    fn params() -> ParameterSet {
        ParameterSet::from_toml(SETTINGS).unwrap()
    }

    #[test]
    fn test_dotted_and_nested_lookup() {
        let p = params();
        assert_eq!(p.require_str("paths.scratch").unwrap(), "/scratch/run");
        assert_eq!(p.require_path("paths.durable").unwrap(), PathBuf::from("/project/run"));
        assert!(p.get("paths.missing").is_none());
    }

    #[test]
    fn test_typed_getters() {
        let p = params();
        assert_eq!(p.require_list("algorithms").unwrap().len(), 4);
        assert_eq!(p.require_u32("n_levels").unwrap(), 2);
        assert!(p.require_flag("do_proj").unwrap());
        assert!(!p.flag("sync.clear_scratch", false).unwrap());
    }

    #[test]
    fn test_missing_key_names_key() {
        let err = params().require_list("nesting_methods").unwrap_err();
        assert_eq!(err.key.as_deref(), Some("nesting_methods"));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let err = params().require_list("n_levels").unwrap_err();
        assert!(err.message.contains("expected a list of strings"));
        assert!(params().require_u32("algorithms").is_err());
    }

    #[test]
    fn test_delimited_list_splits_and_trims() {
        let p = params();
        assert_eq!(
            p.delimited_list("sync.exclude", ',').unwrap(),
            vec!["tmp/".to_string(), "*.aux.xml".to_string()]
        );
        assert_eq!(
            p.delimited_list("algorithms", ',').unwrap(),
            vec!["glm", "gam", "rf", "maxent"]
        );
        assert!(p.delimited_list("absent", ',').unwrap().is_empty());
    }
}
