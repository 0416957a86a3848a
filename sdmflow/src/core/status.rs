//! Scheduler terminal states and the pipeline driver state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state a scheduler job (or a whole job array) ended in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// Every task exited zero.
    Completed,
    /// At least one task exited non-zero.
    Failed,
    /// At least one task hit its wall-time limit.
    TimedOut,
    /// The job was cancelled by a user or an administrator.
    Cancelled,
    /// At least one task was killed for exceeding its memory.
    OutOfMemory,
    /// A node failure killed at least one task.
    NodeFail,
    /// A state the adapter does not recognise.
    Unknown(String),
}

impl TerminalState {
    /// Parses a Slurm job state as printed by `sacct` or `squeue`.
    ///
    /// Trailing qualifiers such as `CANCELLED by 1234` and the `+` suffix
    /// are ignored.
    #[must_use]
    pub fn from_slurm(raw: &str) -> Self {
        match slurm_state_head(raw).as_str() {
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" | "BOOT_FAIL" | "BF" | "DEADLINE" | "DL" => Self::Failed,
            "TIMEOUT" | "TO" => Self::TimedOut,
            "CANCELLED" | "CA" | "PREEMPTED" | "PR" => Self::Cancelled,
            "OUT_OF_MEMORY" | "OOM" => Self::OutOfMemory,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }

    /// Returns true for a Slurm state a job passes through before it ends,
    /// such as `PENDING`, `RUNNING` or `COMPLETING`.
    ///
    /// Accounting can still report these for a short while after
    /// `sbatch --wait` has returned.
    #[must_use]
    pub fn is_transient_slurm(raw: &str) -> bool {
        matches!(
            slurm_state_head(raw).as_str(),
            "PENDING"
                | "PD"
                | "RUNNING"
                | "R"
                | "COMPLETING"
                | "CG"
                | "CONFIGURING"
                | "CF"
                | "REQUEUED"
                | "RQ"
                | "REQUEUE_FED"
                | "RF"
                | "REQUEUE_HOLD"
                | "RH"
                | "RESIZING"
                | "RS"
                | "SUSPENDED"
                | "S"
                | "STOPPED"
                | "ST"
                | "SIGNALING"
                | "SI"
                | "STAGE_OUT"
                | "SO"
        )
    }

    /// Returns true only for a clean completion.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Folds the states of every task in an array into one array state.
    ///
    /// The array completed only if every task completed; otherwise the first
    /// non-completed state wins. An empty slice is `Unknown`.
    #[must_use]
    pub fn combine(states: &[Self]) -> Self {
        if states.is_empty() {
            return Self::Unknown("no task states reported".to_string());
        }
        states
            .iter()
            .find(|state| !state.is_success())
            .cloned()
            .unwrap_or(Self::Completed)
    }
}

fn slurm_state_head(raw: &str) -> String {
    raw.split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('+')
        .to_ascii_uppercase()
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::OutOfMemory => write!(f, "out_of_memory"),
            Self::NodeFail => write!(f, "node_fail"),
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// Where the pipeline driver is within one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage_index")]
pub enum DriverState {
    /// No batch has started.
    #[default]
    Idle,
    /// The stage at this catalog index is submitted and awaited.
    Running(usize),
    /// The stage at this catalog index did not complete.
    StageFailed(usize),
    /// Every included stage completed.
    Completed,
}

impl DriverState {
    /// Moves to the next state after the stage at `index` finished.
    ///
    /// `next` is the catalog index of the following included stage, if any.
    #[must_use]
    pub fn advance(self, index: usize, succeeded: bool, next: Option<usize>) -> Self {
        match (succeeded, next) {
            (false, _) => Self::StageFailed(index),
            (true, Some(next)) => Self::Running(next),
            (true, None) => Self::Completed,
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running(i) => write!(f, "running({i})"),
            Self::StageFailed(i) => write!(f, "stage_failed({i})"),
            Self::Completed => write!(f, "completed"),
        }
    }
}
