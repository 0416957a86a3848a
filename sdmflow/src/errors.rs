//! Error types for sdmflow.
//!
//! The taxonomy follows the way a run can fail: bad configuration, a stage
//! array that did not complete, an archival phase that did not complete, and
//! an aggregation job that could not be submitted. [`SdmflowError`] is the
//! umbrella type returned by the driver, the batcher and the archiver.

use crate::core::TerminalState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for sdmflow operations.
#[derive(Debug, Error)]
pub enum SdmflowError {
    /// A setting is missing or unusable.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A stage was rejected by the scheduler or its array did not complete.
    #[error("{0}")]
    StageSubmission(#[from] StageSubmissionError),

    /// One of the archival phases failed.
    #[error("{0}")]
    Sync(#[from] SyncError),

    /// An aggregation job could not be submitted.
    #[error("{0}")]
    AggregationSubmission(#[from] AggregationSubmissionError),

    /// IO error outside of a specific phase.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdmflowError {
    /// Process exit code used by the command-line front end.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => 2,
            Self::StageSubmission(_) => 3,
            Self::Sync(_) => 4,
            Self::AggregationSubmission(_) => 5,
            Self::Io(_) => 1,
        }
    }
}

/// Error raised when a setting is absent or cannot be interpreted.
#[derive(Debug, Clone, Error)]
pub struct ConfigurationError {
    /// The offending key, when there is one.
    pub key: Option<String>,
    /// What went wrong.
    pub message: String,
}

impl ConfigurationError {
    /// Creates a configuration error that is not tied to a key.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            key: None,
            message: message.into(),
        }
    }

    /// Creates an error for a required key that is absent.
    #[must_use]
    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            message: "required setting is missing".to_string(),
        }
    }

    /// Creates an error for a key whose value is unusable.
    #[must_use]
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "Configuration error for '{}': {}", key, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

/// Error raised when a stage submission is rejected or its array fails.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' failed{}: {message}", .batch.map(|b| format!(" in batch {b}")).unwrap_or_default())]
pub struct StageSubmissionError {
    /// The stage name.
    pub stage: String,
    /// The batch the stage belonged to.
    pub batch: Option<u32>,
    /// Terminal state reported by the scheduler, if the job ran at all.
    pub terminal_state: Option<TerminalState>,
    /// Scheduler job id, if the job was accepted.
    pub job_id: Option<String>,
    /// Details.
    pub message: String,
}

impl StageSubmissionError {
    /// Creates a new stage submission error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            batch: None,
            terminal_state: None,
            job_id: None,
            message: message.into(),
        }
    }

    /// Sets the batch index.
    #[must_use]
    pub fn with_batch(mut self, batch: u32) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Sets the terminal state.
    #[must_use]
    pub fn with_terminal_state(mut self, state: TerminalState) -> Self {
        self.terminal_state = Some(state);
        self
    }

    /// Sets the scheduler job id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// The archival phase an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Manifest-driven copy of fitted model objects.
    Selective,
    /// Whole-tree mirror with exclusions.
    Bulk,
    /// Clearing scratch after a successful sync.
    Cleanup,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selective => write!(f, "selective"),
            Self::Bulk => write!(f, "bulk"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Error raised when an archival phase fails.
#[derive(Debug, Clone, Error)]
#[error("Archival {phase} phase failed{}: {message}", .batch.map(|b| format!(" for batch {b}")).unwrap_or_default())]
pub struct SyncError {
    /// The failing phase.
    pub phase: SyncPhase,
    /// The batch being archived.
    pub batch: Option<u32>,
    /// Details.
    pub message: String,
}

impl SyncError {
    /// Creates a new sync error.
    #[must_use]
    pub fn new(phase: SyncPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            batch: None,
            message: message.into(),
        }
    }

    /// Sets the batch index.
    #[must_use]
    pub fn with_batch(mut self, batch: u32) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// Error raised when one aggregation group cannot be submitted.
#[derive(Debug, Clone, Error)]
#[error("Aggregation for group '{group}' failed: {message}")]
pub struct AggregationSubmissionError {
    /// The group name.
    pub group: String,
    /// Details.
    pub message: String,
}

impl AggregationSubmissionError {
    /// Creates a new aggregation submission error.
    #[must_use]
    pub fn new(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by a job scheduler adapter or an external command.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The program could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// The program name.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The scheduler refused the submission.
    #[error("submission rejected (exit code {code:?}): {stderr}")]
    Rejected {
        /// Exit code of the submission command.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The scheduler answered with something we could not parse.
    #[error("unexpected scheduler response: {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_names_key() {
        let err = ConfigurationError::missing("algorithms");
        assert_eq!(
            err.to_string(),
            "Configuration error for 'algorithms': required setting is missing"
        );
        assert_eq!(ConfigurationError::new("boom").to_string(), "Configuration error: boom");
    }

    #[test]
    fn test_stage_error_display_includes_batch() {
        let err = StageSubmissionError::new("regional_fit", "array terminated failed")
            .with_batch(2)
            .with_terminal_state(TerminalState::Failed);
        assert_eq!(
            err.to_string(),
            "Stage 'regional_fit' failed in batch 2: array terminated failed"
        );
    }

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::new(SyncPhase::Selective, "rsync exited 23").with_batch(1);
        assert_eq!(
            err.to_string(),
            "Archival selective phase failed for batch 1: rsync exited 23"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors: Vec<SdmflowError> = vec![
            ConfigurationError::new("x").into(),
            StageSubmissionError::new("s", "x").into(),
            SyncError::new(SyncPhase::Bulk, "x").into(),
            AggregationSubmissionError::new("g", "x").into(),
        ];
        let codes: Vec<u8> = errors.iter().map(SdmflowError::exit_code).collect();
        assert_eq!(codes, vec![2, 3, 4, 5]);
    }
}
