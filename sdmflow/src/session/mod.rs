//! Session context.
//!
//! Everything a run needs to know about paths and identity is captured once
//! in an immutable [`SessionContext`] and passed to every component. Nothing
//! in the crate depends on the process working directory.

mod combinations;
mod layout;

pub use combinations::{build_combination_file, read_combinations};
pub use layout::SessionLayout;

use crate::config::ParameterSet;
use crate::errors::{ConfigurationError, SdmflowError};
use crate::utils::{generate_session_id, now_utc, Timestamp};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Default location of fitted models inside the output tree.
pub const DEFAULT_FINISHED_MODELS_DIR: &str = "finished_models";

/// Immutable per-run context.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: Uuid,
    started_at: Timestamp,
    layout: SessionLayout,
    pipeline_dir: PathBuf,
    combinations: Vec<String>,
}

impl SessionContext {
    /// Creates a session context.
    #[must_use]
    pub fn new(layout: SessionLayout, pipeline_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: generate_session_id(),
            started_at: now_utc(),
            layout,
            pipeline_dir: pipeline_dir.into(),
            combinations: Vec::new(),
        }
    }

    /// Sets the simulation combinations.
    #[must_use]
    pub fn with_combinations(mut self, combinations: Vec<String>) -> Self {
        self.combinations = combinations;
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    /// Builds the context from settings without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if a required path is missing.
    pub fn from_params(params: &ParameterSet) -> Result<Self, ConfigurationError> {
        let scratch = params.require_path("paths.scratch")?;
        let durable = params.require_path("paths.durable")?;
        let pipeline = params.require_path("paths.pipeline")?;
        let finished_models = params
            .optional_path("paths.finished_models")?
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FINISHED_MODELS_DIR));

        if finished_models.is_absolute() {
            return Err(ConfigurationError::invalid(
                "paths.finished_models",
                "must be relative to the scratch output tree",
            ));
        }

        Ok(Self::new(
            SessionLayout::new(scratch, durable, finished_models),
            pipeline,
        ))
    }

    /// Prepares a new session on disk.
    ///
    /// Creates the driver's directories, records the session id and builds
    /// the simulation-combination file when a control table is configured.
    /// Without a control table, any combination file on scratch is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if settings are incomplete or a file cannot be
    /// written.
    pub fn bootstrap(params: &ParameterSet) -> Result<Self, SdmflowError> {
        let mut session = Self::from_params(params)?;
        session.layout.ensure_dirs()?;
        session.record_session_id()?;

        if let Some(table) = params.optional_path("simulation.control_table")? {
            let first = params.require_str("simulation.first_column")?;
            let second = params.require_str("simulation.second_column")?;
            let delimiter = delimiter(params)?;
            session.combinations = build_combination_file(
                &table,
                first,
                second,
                delimiter,
                &session.layout.combinations_file(),
            )?;
        } else {
            session.layout.clear_combinations()?;
        }

        info!(
            session_id = %session.session_id,
            scratch = %session.layout.scratch().display(),
            combinations = session.combinations.len(),
            "Session bootstrapped"
        );
        Ok(session)
    }

    /// Appends this session's id to the session id file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn record_session_id(&self) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.session_id_file())?;
        writeln!(file, "{}", self.session_id)
    }

    /// The session id.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// When the session started.
    #[must_use]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// The state layout.
    #[must_use]
    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    /// Directory holding the stage work units.
    #[must_use]
    pub fn pipeline_dir(&self) -> &Path {
        &self.pipeline_dir
    }

    /// Simulation combinations built at bootstrap (empty if none).
    #[must_use]
    pub fn combinations(&self) -> &[String] {
        &self.combinations
    }
}

fn delimiter(params: &ParameterSet) -> Result<char, ConfigurationError> {
    let Some(raw) = params.optional_str("simulation.delimiter")? else {
        return Ok(',');
    };
    match raw {
        "\\t" | "tab" => Ok('\t'),
        _ => {
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(c),
                _ => Err(ConfigurationError::invalid(
                    "simulation.delimiter",
                    "must be a single character",
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(root: &Path, extra: &str) -> ParameterSet {
        ParameterSet::from_toml(&format!(
            r#"
            [paths]
            scratch = "{scratch}"
            durable = "{durable}"
            pipeline = "/opt/pipeline"
            {extra}
            "#,
            scratch = root.join("scratch").display(),
            durable = root.join("durable").display(),
        ))
        .unwrap()
    }

    #[test]
    fn test_from_params_requires_paths() {
        let params = ParameterSet::from_toml("[paths]\nscratch = \"/s\"\n").unwrap();
        let err = SessionContext::from_params(&params).unwrap_err();
        assert_eq!(err.key.as_deref(), Some("paths.durable"));
    }

    #[test]
    fn test_absolute_finished_models_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let params = settings(dir.path(), "finished_models = \"/abs\"");
        assert!(SessionContext::from_params(&params).is_err());
    }

    #[test]
    fn test_bootstrap_records_sessions_and_combinations() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("control.csv");
        std::fs::write(&table, "gcm,ssp\nipsl,ssp126\nukesm,ssp585\n").unwrap();
        let params = settings(
            dir.path(),
            &format!(
                "[simulation]\ncontrol_table = \"{}\"\nfirst_column = \"gcm\"\nsecond_column = \"ssp\"",
                table.display()
            ),
        );

        let first = SessionContext::bootstrap(&params).unwrap();
        let second = SessionContext::bootstrap(&params).unwrap();

        assert_eq!(first.combinations(), &["ipsl_ssp126", "ukesm_ssp585"]);
        let ids = std::fs::read_to_string(first.layout().session_id_file()).unwrap();
        assert_eq!(
            ids.lines().map(str::to_string).collect::<Vec<_>>(),
            vec![first.session_id().to_string(), second.session_id().to_string()]
        );
        assert!(first.layout().log_root().is_dir());
        assert!(first.layout().combinations_file().is_file());
    }

    #[test]
    fn test_bootstrap_without_table_drops_stale_combinations() {
        let dir = tempfile::tempdir().unwrap();
        let params = settings(dir.path(), "");
        let stale = SessionContext::from_params(&params).unwrap();
        stale.layout().ensure_dirs().unwrap();
        std::fs::write(stale.layout().combinations_file(), "old_a\nold_b\nold_c\n").unwrap();

        let session = SessionContext::bootstrap(&params).unwrap();

        assert!(session.combinations().is_empty());
        assert!(!session.layout().combinations_file().exists());
    }

    #[test]
    fn test_delimiter_parsing() {
        let tab = ParameterSet::from_toml("[simulation]\ndelimiter = \"tab\"\n").unwrap();
        assert_eq!(delimiter(&tab).unwrap(), '\t');
        let none = ParameterSet::default();
        assert_eq!(delimiter(&none).unwrap(), ',');
        let bad = ParameterSet::from_toml("[simulation]\ndelimiter = \";;\"\n").unwrap();
        assert!(delimiter(&bad).is_err());
    }
}
