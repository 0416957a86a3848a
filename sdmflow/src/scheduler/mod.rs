//! Job submission adapters.
//!
//! A [`JobScheduler`] turns one [`SubmissionRequest`] into one scheduler job
//! (or job array) and, in blocking mode, resolves only once every task has
//! reached a terminal state.

mod dry_run;
mod process;
mod slurm;

pub use dry_run::DryRunScheduler;
pub use process::{run_command, CommandOutput};
pub use slurm::SlurmScheduler;

use crate::config::ResourceProfile;
use crate::core::TerminalState;
use crate::errors::SchedulerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether a submission waits for the job to finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Resolve after every task is terminal.
    #[default]
    Blocking,
    /// Resolve once the scheduler has accepted the job.
    Detached,
}

/// Where a job's stdout and stderr land.
///
/// Files are named `<stem>_<job>_<task>.{out,err}` for arrays and
/// `<stem>_<job>.{out,err}` for single jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogScheme {
    /// Directory the logs are written to.
    pub dir: PathBuf,
    /// File name prefix; the stage name.
    pub stem: String,
    /// Whether task indices appear in the file names.
    pub array: bool,
}

impl LogScheme {
    /// The stdout pattern in scheduler notation.
    #[must_use]
    pub fn stdout_pattern(&self) -> PathBuf {
        self.dir.join(self.pattern("out"))
    }

    /// The stderr pattern in scheduler notation.
    #[must_use]
    pub fn stderr_pattern(&self) -> PathBuf {
        self.dir.join(self.pattern("err"))
    }

    fn pattern(&self, ext: &str) -> String {
        if self.array {
            format!("{}_%A_%a.{ext}", self.stem)
        } else {
            format!("{}_%j.{ext}", self.stem)
        }
    }

    /// Concrete stdout paths for a finished job.
    #[must_use]
    pub fn resolve(&self, job_id: &str, extent: NonZeroU32) -> Vec<PathBuf> {
        if self.array {
            (1..=extent.get())
                .map(|task| self.dir.join(format!("{}_{job_id}_{task}.out", self.stem)))
                .collect()
        } else {
            vec![self.dir.join(format!("{}_{job_id}.out", self.stem))]
        }
    }

    /// Returns true if `file_name` belongs to this stage.
    #[must_use]
    pub fn owns(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(&self.stem)
            .is_some_and(|rest| rest.starts_with('_'))
    }
}

/// One unit of work for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// Job name; the stage name for pipeline stages.
    pub stage_name: String,
    /// Memory, time and cores per task.
    pub profile: ResourceProfile,
    /// Number of tasks.
    pub extent: NonZeroU32,
    /// Submit as an array, passing the 1-based task index to the command.
    pub array: bool,
    /// The work unit.
    pub command: PathBuf,
    /// Arguments placed before the task index.
    pub args: Vec<String>,
    /// Directory receiving the job logs.
    pub log_dir: PathBuf,
    /// Blocking or detached.
    pub wait: WaitMode,
    /// Extra environment for the job.
    pub env: Vec<(String, String)>,
}

impl SubmissionRequest {
    /// Creates a blocking single-task request.
    #[must_use]
    pub fn new(
        stage_name: impl Into<String>,
        profile: ResourceProfile,
        command: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            profile,
            extent: NonZeroU32::MIN,
            array: false,
            command: command.into(),
            args: Vec::new(),
            log_dir: log_dir.into(),
            wait: WaitMode::Blocking,
            env: Vec::new(),
        }
    }

    /// Makes this an array of `extent` tasks.
    #[must_use]
    pub fn with_array(mut self, extent: NonZeroU32) -> Self {
        self.extent = extent;
        self.array = true;
        self
    }

    /// Sets the command arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sets the wait mode.
    #[must_use]
    pub fn with_wait(mut self, wait: WaitMode) -> Self {
        self.wait = wait;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The log naming scheme of this request.
    #[must_use]
    pub fn log_scheme(&self) -> LogScheme {
        LogScheme {
            dir: self.log_dir.clone(),
            stem: self.stage_name.clone(),
            array: self.array,
        }
    }

    /// Log directory.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// What the scheduler reported for a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    /// True only if every task completed.
    pub succeeded: bool,
    /// Combined terminal state of the tasks.
    pub terminal_state: TerminalState,
    /// Stdout log of every task.
    pub log_paths: Vec<PathBuf>,
    /// Scheduler job id.
    pub job_id: Option<String>,
    /// Wall time from submission to return.
    pub elapsed: Duration,
}

impl SubmissionOutcome {
    /// Builds an outcome from a terminal state.
    #[must_use]
    pub fn from_state(terminal_state: TerminalState, job_id: Option<String>) -> Self {
        Self {
            succeeded: terminal_state.is_success(),
            terminal_state,
            log_paths: Vec::new(),
            job_id,
            elapsed: Duration::ZERO,
        }
    }

    /// Sets the log paths.
    #[must_use]
    pub fn with_log_paths(mut self, log_paths: Vec<PathBuf>) -> Self {
        self.log_paths = log_paths;
        self
    }

    /// Sets the elapsed time.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Submits work to an external batch scheduler.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Submits one request.
    ///
    /// A job that runs and fails is an `Ok` outcome with
    /// `succeeded == false`; `Err` means the job never ran.
    async fn submit(&self, request: &SubmissionRequest)
        -> Result<SubmissionOutcome, SchedulerError>;

    /// Returns the scheduler's accounting record for the given jobs.
    async fn accounting(&self, job_ids: &[String]) -> Result<String, SchedulerError>;
}
