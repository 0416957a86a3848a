//! The external settings-update step.

use super::interfaces::SettingsUpdater;
use crate::config::ParameterSet;
use crate::core::Batch;
use crate::errors::{ConfigurationError, SdmflowError};
use crate::scheduler::run_command;
use crate::session::SessionLayout;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

/// Environment variable carrying the 1-based batch index.
pub const BATCH_INDEX_ENV: &str = "SDMFLOW_BATCH_INDEX";
/// Environment variable carrying the state directory.
pub const STATE_DIR_ENV: &str = "SDMFLOW_STATE_DIR";

/// Runs operator-supplied commands to partition entities and select each
/// batch.
///
/// Configured by `settings.update_command` and the optional
/// `settings.partition_command`; both may be given as a string or as an
/// argument list.
#[derive(Debug, Clone)]
pub struct CommandSettingsUpdater {
    update: Vec<String>,
    partition: Option<Vec<String>>,
    layout: SessionLayout,
}

impl CommandSettingsUpdater {
    /// Creates an updater from explicit command lines.
    #[must_use]
    pub fn new(update: Vec<String>, layout: SessionLayout) -> Self {
        Self {
            update,
            partition: None,
            layout,
        }
    }

    /// Sets the partition command.
    #[must_use]
    pub fn with_partition(mut self, partition: Vec<String>) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Reads the commands from the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the update command is missing or empty.
    pub fn from_params(
        params: &ParameterSet,
        layout: SessionLayout,
    ) -> Result<Self, ConfigurationError> {
        let update = command_line(params, "settings.update_command")?
            .ok_or_else(|| ConfigurationError::missing("settings.update_command"))?;
        let mut updater = Self::new(update, layout);
        updater.partition = command_line(params, "settings.partition_command")?;
        Ok(updater)
    }

    fn env(&self, batch: Option<u32>) -> Vec<(String, String)> {
        let mut env = vec![(
            STATE_DIR_ENV.to_string(),
            self.layout.state_dir().display().to_string(),
        )];
        if let Some(batch) = batch {
            env.push((BATCH_INDEX_ENV.to_string(), batch.to_string()));
        }
        env
    }

    async fn run(
        &self,
        key: &str,
        argv: &[String],
        batch: Option<u32>,
    ) -> Result<(), SdmflowError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ConfigurationError::invalid(key, "command is empty"))?;
        debug!(command = %program, ?batch, "Running settings step");

        let output = run_command(PathBuf::from(program), args, &self.env(batch))
            .await
            .map_err(|e| ConfigurationError::invalid(key, e.to_string()))?;
        if !output.success() {
            return Err(ConfigurationError::invalid(
                key,
                format!(
                    "exited with {:?}: {}",
                    output.code,
                    output.stderr.trim()
                ),
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsUpdater for CommandSettingsUpdater {
    async fn partition(&self) -> Result<(), SdmflowError> {
        let Some(partition) = &self.partition else {
            return Ok(());
        };
        self.run("settings.partition_command", partition, None)
            .await?;
        info!(state_dir = %self.layout.state_dir().display(), "Entities partitioned");
        Ok(())
    }

    async fn update(&self, batch: &Batch) -> Result<(), SdmflowError> {
        self.run("settings.update_command", &self.update, Some(batch.index))
            .await
    }
}

fn command_line(
    params: &ParameterSet,
    key: &str,
) -> Result<Option<Vec<String>>, ConfigurationError> {
    let argv = match params.get(key) {
        None => return Ok(None),
        Some(toml::Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(_) => params.require_list(key)?,
    };
    if argv.is_empty() {
        return Err(ConfigurationError::invalid(key, "command is empty"));
    }
    Ok(Some(argv))
}
