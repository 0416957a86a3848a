//! Simulation-combination file.
//!
//! The combination file lists every `<first>_<second>` pair found in two
//! columns of the control table. Its line count is the fan-out of the
//! regional projection stage and its lines are the scenario identifiers the
//! aggregation jobs iterate over.

use crate::errors::ConfigurationError;
use std::path::Path;

/// Builds the combination file from a delimited control table.
///
/// The first row is the header; columns are located by name. Blank rows are
/// skipped and repeated pairs are kept once, in first-seen order.
///
/// # Errors
///
/// Returns an error if the table cannot be read, a column is missing, or no
/// combination is produced.
pub fn build_combination_file(
    control_table: &Path,
    first_column: &str,
    second_column: &str,
    delimiter: char,
    out: &Path,
) -> Result<Vec<String>, ConfigurationError> {
    let content = std::fs::read_to_string(control_table).map_err(|e| {
        ConfigurationError::invalid(
            "simulation.control_table",
            format!("cannot read {}: {e}", control_table.display()),
        )
    })?;

    let combinations = project_columns(&content, first_column, second_column, delimiter)?;

    let mut body = combinations.join("\n");
    body.push('\n');
    std::fs::write(out, body).map_err(|e| {
        ConfigurationError::new(format!("cannot write {}: {e}", out.display()))
    })?;

    Ok(combinations)
}

/// Reads an existing combination file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_combinations(path: &Path) -> std::io::Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn project_columns(
    content: &str,
    first_column: &str,
    second_column: &str,
    delimiter: char,
) -> Result<Vec<String>, ConfigurationError> {
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| ConfigurationError::invalid("simulation.control_table", "table is empty"))?
        .split(delimiter)
        .map(|h| h.trim().trim_matches('"'))
        .collect();

    let position = |key: &str, name: &str| {
        header.iter().position(|h| *h == name).ok_or_else(|| {
            ConfigurationError::invalid(key, format!("column '{name}' not found in control table"))
        })
    };
    let first = position("simulation.first_column", first_column)?;
    let second = position("simulation.second_column", second_column)?;

    let mut combinations: Vec<String> = Vec::new();
    for line in lines {
        let cells: Vec<&str> = line
            .split(delimiter)
            .map(|c| c.trim().trim_matches('"'))
            .collect();
        let (Some(a), Some(b)) = (cells.get(first), cells.get(second)) else {
            continue;
        };
        if a.is_empty() || b.is_empty() {
            continue;
        }
        let combination = format!("{a}_{b}");
        if !combinations.contains(&combination) {
            combinations.push(combination);
        }
    }

    if combinations.is_empty() {
        return Err(ConfigurationError::invalid(
            "simulation.control_table",
            "no simulation combinations found",
        ));
    }
    Ok(combinations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TABLE: &str = "\
id,gcm,ssp,period
1,ipsl,ssp126,2041
2,ipsl,ssp585,2041
3,ukesm,ssp126,2071

4,ipsl,ssp126,2071
";

    #[test]
    fn test_projects_two_columns() {
        let combos = project_columns(TABLE, "gcm", "ssp", ',').unwrap();
        assert_eq!(combos, vec!["ipsl_ssp126", "ipsl_ssp585", "ukesm_ssp126"]);
    }

    #[test]
    fn test_missing_column_names_setting() {
        let err = project_columns(TABLE, "gcm", "rcp", ',').unwrap_err();
        assert_eq!(err.key.as_deref(), Some("simulation.second_column"));
    }

    #[test]
    fn test_header_only_table_is_rejected() {
        assert!(project_columns("gcm,ssp\n", "gcm", "ssp", ',').is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("control.tsv");
        std::fs::write(&table, "gcm\tssp\nipsl\tssp126\nipsl\tssp370\n").unwrap();
        let out = dir.path().join("sim_combinations.txt");

        let built = build_combination_file(&table, "gcm", "ssp", '\t', &out).unwrap();
        assert_eq!(built.len(), 2);
        assert_eq!(read_combinations(&out).unwrap(), built);
    }
}
