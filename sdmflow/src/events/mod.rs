//! Structured pipeline events.
//!
//! Every driver transition, archival phase and aggregation submission is
//! reported as a [`PipelineEvent`] to an [`EventSink`]. Production runs log
//! them through `tracing`; tests collect them in memory.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::TerminalState;
use crate::errors::SyncPhase;
use serde::{Deserialize, Serialize};

/// A pipeline event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    /// A batch began.
    #[serde(rename = "batch.started")]
    BatchStarted {
        /// 1-based batch index.
        batch: u32,
        /// Total batches in the run.
        total: u32,
    },
    /// A batch ran, archived and cleaned up.
    #[serde(rename = "batch.completed")]
    BatchCompleted {
        /// 1-based batch index.
        batch: u32,
        /// Batch wall time in seconds.
        elapsed_secs: u64,
    },
    /// A batch aborted the run.
    #[serde(rename = "batch.failed")]
    BatchFailed {
        /// 1-based batch index.
        batch: u32,
        /// The error message.
        error: String,
    },
    /// A stage was handed to the scheduler.
    #[serde(rename = "stage.submitted")]
    StageSubmitted {
        /// 1-based batch index.
        batch: u32,
        /// Stage name.
        stage: String,
        /// Number of tasks.
        extent: u32,
    },
    /// Every task of a stage completed.
    #[serde(rename = "stage.completed")]
    StageCompleted {
        /// 1-based batch index.
        batch: u32,
        /// Stage name.
        stage: String,
        /// Scheduler job id.
        job_id: Option<String>,
        /// Stage wall time in seconds.
        elapsed_secs: u64,
    },
    /// A stage was rejected or did not complete.
    #[serde(rename = "stage.failed")]
    StageFailed {
        /// 1-based batch index.
        batch: u32,
        /// Stage name.
        stage: String,
        /// Terminal state, if the job ran.
        terminal_state: Option<TerminalState>,
        /// Details.
        error: String,
    },
    /// A stage was excluded for this run.
    #[serde(rename = "stage.skipped")]
    StageSkipped {
        /// 1-based batch index.
        batch: u32,
        /// Stage name.
        stage: String,
    },
    /// An archival phase began.
    #[serde(rename = "sync.started")]
    SyncStarted {
        /// 1-based batch index.
        batch: u32,
        /// The phase.
        phase: SyncPhase,
    },
    /// An archival phase finished.
    #[serde(rename = "sync.completed")]
    SyncCompleted {
        /// 1-based batch index.
        batch: u32,
        /// The phase.
        phase: SyncPhase,
        /// Files copied.
        files: u64,
    },
    /// An archival phase failed.
    #[serde(rename = "sync.failed")]
    SyncFailed {
        /// 1-based batch index.
        batch: u32,
        /// The phase.
        phase: SyncPhase,
        /// Details.
        error: String,
    },
    /// An aggregation job was accepted.
    #[serde(rename = "aggregation.submitted")]
    AggregationSubmitted {
        /// Group name.
        group: String,
        /// Scheduler job id.
        job_id: Option<String>,
    },
    /// An aggregation job could not be submitted or failed.
    #[serde(rename = "aggregation.failed")]
    AggregationFailed {
        /// Group name.
        group: String,
        /// Details.
        error: String,
    },
}

impl PipelineEvent {
    /// The dotted event type, e.g. `stage.completed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BatchStarted { .. } => "batch.started",
            Self::BatchCompleted { .. } => "batch.completed",
            Self::BatchFailed { .. } => "batch.failed",
            Self::StageSubmitted { .. } => "stage.submitted",
            Self::StageCompleted { .. } => "stage.completed",
            Self::StageFailed { .. } => "stage.failed",
            Self::StageSkipped { .. } => "stage.skipped",
            Self::SyncStarted { .. } => "sync.started",
            Self::SyncCompleted { .. } => "sync.completed",
            Self::SyncFailed { .. } => "sync.failed",
            Self::AggregationSubmitted { .. } => "aggregation.submitted",
            Self::AggregationFailed { .. } => "aggregation.failed",
        }
    }

    /// The stage this event is about, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageSubmitted { stage, .. }
            | Self::StageCompleted { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::StageSkipped { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// The event as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
