//! In-memory collaborators for driving a pipeline without a cluster.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

use crate::core::{Batch, TerminalState};
use crate::errors::{SchedulerError, SdmflowError, SyncError, SyncPhase};
use crate::pipeline::{BatchArchiver, BatchReport, SettingsUpdater};
use crate::scheduler::{JobScheduler, SubmissionOutcome, SubmissionRequest};
use crate::session::SessionLayout;
use crate::sync::{ArchiveReport, ExcludeList, Mirror, MirrorError, MirrorStats};

/// A scheduler that records every request and completes it immediately.
///
/// Job ids are sequential from 1001. Failures are scripted by stage name or
/// by 1-based call number.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    requests: Mutex<Vec<SubmissionRequest>>,
    fail_stages: Vec<String>,
    fail_calls: Vec<usize>,
    reject_calls: Vec<usize>,
}

impl RecordingScheduler {
    /// Creates a scheduler on which everything completes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submission of `stage` ends `FAILED`.
    #[must_use]
    pub fn fail_stage(mut self, stage: impl Into<String>) -> Self {
        self.fail_stages.push(stage.into());
        self
    }

    /// The `call`-th submission ends `FAILED`.
    #[must_use]
    pub fn fail_call(mut self, call: usize) -> Self {
        self.fail_calls.push(call);
        self
    }

    /// The `call`-th submission is refused outright.
    #[must_use]
    pub fn reject_call(mut self, call: usize) -> Self {
        self.reject_calls.push(call);
        self
    }

    /// Requests in submission order.
    #[must_use]
    pub fn requests(&self) -> Vec<SubmissionRequest> {
        self.requests.lock().clone()
    }

    /// Stage names in submission order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.stage_name.clone())
            .collect()
    }

    /// Number of submissions.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit(
        &self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionOutcome, SchedulerError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };

        if self.reject_calls.contains(&call) {
            return Err(SchedulerError::Rejected {
                code: Some(1),
                stderr: "sbatch: error: Batch job submission failed".to_string(),
            });
        }

        let job_id = (1000 + call).to_string();
        let state = if self.fail_calls.contains(&call)
            || self.fail_stages.iter().any(|s| *s == request.stage_name)
        {
            TerminalState::Failed
        } else {
            TerminalState::Completed
        };
        Ok(SubmissionOutcome::from_state(state, Some(job_id.clone()))
            .with_log_paths(request.log_scheme().resolve(&job_id, request.extent)))
    }

    async fn accounting(&self, job_ids: &[String]) -> Result<String, SchedulerError> {
        let mut table = String::from("JobID|State\n");
        for id in job_ids {
            table.push_str(id);
            table.push_str("|COMPLETED\n");
        }
        Ok(table)
    }
}

/// A mirror that records which phases ran and copies nothing.
#[derive(Debug, Default)]
pub struct RecordingMirror {
    calls: Mutex<Vec<SyncPhase>>,
    fail: Option<SyncPhase>,
}

impl RecordingMirror {
    /// Creates a mirror on which every phase succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The given phase fails.
    #[must_use]
    pub fn fail_phase(mut self, phase: SyncPhase) -> Self {
        self.fail = Some(phase);
        self
    }

    /// Phases attempted, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SyncPhase> {
        self.calls.lock().clone()
    }

    fn record(&self, phase: SyncPhase, files: usize) -> Result<MirrorStats, MirrorError> {
        self.calls.lock().push(phase);
        if self.fail == Some(phase) {
            return Err(MirrorError::Failed {
                tool: "recording".to_string(),
                code: Some(23),
                stderr: format!("{phase} phase scripted to fail"),
            });
        }
        Ok(MirrorStats {
            copied: files as u64,
            unchanged: 0,
        })
    }
}

#[async_trait]
impl Mirror for RecordingMirror {
    fn name(&self) -> &str {
        "recording"
    }

    async fn copy_listed(
        &self,
        _src: &Path,
        _dest: &Path,
        files: &[PathBuf],
        _manifest: &Path,
    ) -> Result<MirrorStats, MirrorError> {
        self.record(SyncPhase::Selective, files.len())
    }

    async fn mirror_tree(
        &self,
        _src: &Path,
        _dest: &Path,
        _excludes: &ExcludeList,
        _exclude_file: &Path,
    ) -> Result<MirrorStats, MirrorError> {
        self.record(SyncPhase::Bulk, 0)
    }
}

/// An archiver that records batch indices.
#[derive(Debug, Default)]
pub struct RecordingArchiver {
    archived: Mutex<Vec<u32>>,
    fail_batch: Option<u32>,
}

impl RecordingArchiver {
    /// Creates an archiver on which every batch succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Archiving `batch` fails in the bulk phase.
    #[must_use]
    pub fn fail_batch(mut self, batch: u32) -> Self {
        self.fail_batch = Some(batch);
        self
    }

    /// Batches archived successfully, in order.
    #[must_use]
    pub fn archived(&self) -> Vec<u32> {
        self.archived.lock().clone()
    }
}

#[async_trait]
impl BatchArchiver for RecordingArchiver {
    async fn archive(
        &self,
        batch: &Batch,
        _report: &BatchReport,
    ) -> Result<ArchiveReport, SdmflowError> {
        if self.fail_batch == Some(batch.index) {
            return Err(SyncError::new(SyncPhase::Bulk, "scripted failure")
                .with_batch(batch.index)
                .into());
        }
        self.archived.lock().push(batch.index);
        Ok(ArchiveReport {
            batch: batch.index,
            manifest_entries: 0,
            selective: MirrorStats::default(),
            bulk: MirrorStats::default(),
            cleared: false,
            accounting_log: None,
        })
    }
}

/// A settings step that writes `entities_per_batch` entity names per batch.
#[derive(Debug)]
pub struct ScriptedSettingsUpdater {
    layout: SessionLayout,
    entities_per_batch: u32,
    partitions: Mutex<usize>,
    updates: Mutex<Vec<u32>>,
}

impl ScriptedSettingsUpdater {
    /// Creates the updater.
    #[must_use]
    pub fn new(layout: SessionLayout, entities_per_batch: u32) -> Self {
        Self {
            layout,
            entities_per_batch,
            partitions: Mutex::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Batches updated, in order.
    #[must_use]
    pub fn updates(&self) -> Vec<u32> {
        self.updates.lock().clone()
    }

    /// Number of partition calls.
    #[must_use]
    pub fn partitions(&self) -> usize {
        *self.partitions.lock()
    }
}

#[async_trait]
impl SettingsUpdater for ScriptedSettingsUpdater {
    async fn partition(&self) -> Result<(), SdmflowError> {
        *self.partitions.lock() += 1;
        Ok(())
    }

    async fn update(&self, batch: &Batch) -> Result<(), SdmflowError> {
        let names: String = (1..=self.entities_per_batch)
            .map(|i| format!("b{}_sp{i}\n", batch.index))
            .collect();
        std::fs::write(self.layout.entity_list(), names)?;
        std::fs::write(
            self.layout.entity_count(),
            format!("{}\n", self.entities_per_batch),
        )?;
        self.updates.lock().push(batch.index);
        Ok(())
    }
}
