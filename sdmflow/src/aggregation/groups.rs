//! Aggregation groups and evaluation years.

use crate::errors::ConfigurationError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One group of entities aggregated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationGroup {
    /// Group name, the file stem of the group file.
    pub name: String,
    /// The group file; one entity name per line.
    pub entity_list: PathBuf,
}

/// Lists the group files of `dir`, sorted by file name.
///
/// Hidden files and subdirectories are ignored.
///
/// # Errors
///
/// Returns an error if the directory cannot be read, or if two files share
/// a stem (`north.txt` and `north.csv`) and so would share a job name and
/// an output directory.
pub fn discover_groups(dir: &Path) -> Result<Vec<AggregationGroup>, ConfigurationError> {
    let unreadable = |e: std::io::Error| {
        ConfigurationError::invalid(
            "aggregation.groups_dir",
            format!("cannot read {}: {e}", dir.display()),
        )
    };

    let mut groups = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with('.') || !entry.file_type().map_err(unreadable)?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = path
            .file_stem()
            .map_or_else(|| file_name.to_string(), |s| s.to_string_lossy().into_owned());
        groups.push(AggregationGroup {
            name,
            entity_list: path,
        });
    }
    groups.sort_by(|a, b| a.entity_list.cmp(&b.entity_list));

    let mut seen: HashMap<&str, &Path> = HashMap::new();
    for group in &groups {
        if let Some(first) = seen.insert(&group.name, &group.entity_list) {
            return Err(ConfigurationError::invalid(
                "aggregation.groups_dir",
                format!(
                    "{} and {} both define group '{}'",
                    first.display(),
                    group.entity_list.display(),
                    group.name
                ),
            ));
        }
    }
    Ok(groups)
}

/// `start..=end` in steps of `step`.
///
/// # Errors
///
/// Returns an error if `step` is zero or `start` is after `end`.
pub fn evaluation_years(start: u32, end: u32, step: u32) -> Result<Vec<u32>, ConfigurationError> {
    if step == 0 {
        return Err(ConfigurationError::invalid(
            "aggregation.period_step",
            "must be at least 1",
        ));
    }
    if start > end {
        return Err(ConfigurationError::invalid(
            "aggregation.period_start",
            format!("{start} is after period_end {end}"),
        ));
    }
    Ok((start..=end).step_by(step as usize).collect())
}
