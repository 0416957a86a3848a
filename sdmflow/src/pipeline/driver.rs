//! The pipeline driver.

use super::interfaces::BatchPipeline;
use super::plan::{ExecutionPlan, PlannedStage};
use super::settings::{BATCH_INDEX_ENV, STATE_DIR_ENV};
use crate::config::ParameterSet;
use crate::core::{Batch, DriverState, DynamicCounts, TerminalState};
use crate::errors::{SdmflowError, StageSubmissionError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::scheduler::{JobScheduler, SubmissionOutcome, SubmissionRequest};
use crate::session::SessionContext;
use crate::stages::{PipelineToggles, StageCatalog};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to one stage of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub stage: String,
    /// Number of tasks submitted.
    pub extent: u32,
    /// Scheduler job id.
    pub job_id: Option<String>,
    /// Combined terminal state.
    pub terminal_state: TerminalState,
    /// Wall time of the stage.
    pub elapsed: Duration,
}

/// Summary of one batch run by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// 1-based batch index.
    pub batch: u32,
    /// Where the driver stopped.
    pub state: DriverState,
    /// Completed stages, in order.
    pub stages: Vec<StageRecord>,
    /// Stages excluded from this batch.
    pub skipped: Vec<String>,
}

impl BatchReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new(batch: u32) -> Self {
        Self {
            batch,
            state: DriverState::Idle,
            stages: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Scheduler job ids of every completed stage.
    #[must_use]
    pub fn job_ids(&self) -> Vec<String> {
        self.stages.iter().filter_map(|s| s.job_id.clone()).collect()
    }

    /// Sum of stage wall times.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.stages.iter().map(|s| s.elapsed).sum()
    }

    /// Returns true if every included stage completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == DriverState::Completed
    }
}

/// Walks the catalog for one batch, submitting each included stage and
/// waiting for it before the next.
pub struct PipelineDriver {
    catalog: StageCatalog,
    params: ParameterSet,
    toggles: PipelineToggles,
    session: Arc<SessionContext>,
    scheduler: Arc<dyn JobScheduler>,
    events: Arc<dyn EventSink>,
    state: Mutex<DriverState>,
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("stages", &self.catalog.len())
            .field("toggles", &self.toggles)
            .field("scheduler", &self.scheduler.name())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl PipelineDriver {
    /// Creates a driver.
    #[must_use]
    pub fn new(
        catalog: StageCatalog,
        params: ParameterSet,
        toggles: PipelineToggles,
        session: Arc<SessionContext>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            catalog,
            params,
            toggles,
            session,
            scheduler,
            events: Arc::new(NoOpEventSink),
            state: Mutex::new(DriverState::Idle),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The state after the most recent transition.
    #[must_use]
    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    /// Plans a batch without submitting anything.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails.
    pub fn plan(&self, counts: &DynamicCounts) -> Result<ExecutionPlan, SdmflowError> {
        Ok(ExecutionPlan::build(
            &self.catalog,
            &self.params,
            &self.toggles,
            counts,
            &self.session,
        )?)
    }

    fn transition(&self, next: DriverState) {
        let mut state = self.state.lock();
        debug!(from = %*state, to = %next, "Driver transition");
        *state = next;
    }

    fn request(&self, stage: &PlannedStage, batch: &Batch) -> SubmissionRequest {
        let mut request =
            SubmissionRequest::new(&stage.name, stage.profile.clone(), &stage.command, &stage.log_dir)
                .with_env(BATCH_INDEX_ENV, batch.index.to_string())
                .with_env(
                    STATE_DIR_ENV,
                    self.session.layout().state_dir().display().to_string(),
                );
        if !stage.fan_out.is_scalar() {
            request = request.with_array(stage.extent);
        }
        request
    }

    async fn fail(
        &self,
        batch: &Batch,
        catalog_index: usize,
        error: StageSubmissionError,
    ) -> SdmflowError {
        self.transition(DriverState::StageFailed(catalog_index));
        error!(stage = %error.stage, batch = batch.index, error = %error, "Stage failed");
        self.events
            .emit(&PipelineEvent::StageFailed {
                batch: batch.index,
                stage: error.stage.clone(),
                terminal_state: error.terminal_state.clone(),
                error: error.message.clone(),
            })
            .await;
        error.into()
    }
}

#[async_trait]
impl BatchPipeline for PipelineDriver {
    async fn run_batch(
        &self,
        batch: &Batch,
        counts: &DynamicCounts,
    ) -> Result<BatchReport, SdmflowError> {
        let plan = self.plan(counts)?;
        let mut report = BatchReport::new(batch.index);
        report.skipped = plan.skipped().to_vec();

        for stage in plan.skipped() {
            self.events
                .emit(&PipelineEvent::StageSkipped {
                    batch: batch.index,
                    stage: stage.clone(),
                })
                .await;
        }

        let stages = plan.stages();
        match stages.first() {
            Some(first) => self.transition(DriverState::Running(first.catalog_index)),
            None => warn!(batch = batch.index, "No stage is included; nothing to run"),
        }

        for (position, stage) in stages.iter().enumerate() {
            if let Err(e) = prepare_log_dir(&stage.log_dir, &stage.name) {
                let error = StageSubmissionError::new(
                    &stage.name,
                    format!("cannot prepare log directory {}: {e}", stage.log_dir.display()),
                )
                .with_batch(batch.index);
                return Err(self.fail(batch, stage.catalog_index, error).await);
            }

            info!(
                stage = %stage.name,
                batch = batch.index,
                extent = stage.extent.get(),
                "Submitting stage"
            );
            self.events
                .emit(&PipelineEvent::StageSubmitted {
                    batch: batch.index,
                    stage: stage.name.clone(),
                    extent: stage.extent.get(),
                })
                .await;

            let request = self.request(stage, batch);
            let outcome: SubmissionOutcome = match self.scheduler.submit(&request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = StageSubmissionError::new(&stage.name, format!("submission failed: {e}"))
                        .with_batch(batch.index);
                    return Err(self.fail(batch, stage.catalog_index, error).await);
                }
            };

            if !outcome.succeeded {
                let mut error = StageSubmissionError::new(
                    &stage.name,
                    format!(
                        "array ended {}; logs are in {}",
                        outcome.terminal_state,
                        stage.log_dir.display()
                    ),
                )
                .with_batch(batch.index)
                .with_terminal_state(outcome.terminal_state.clone());
                if let Some(job_id) = &outcome.job_id {
                    error = error.with_job_id(job_id);
                }
                return Err(self.fail(batch, stage.catalog_index, error).await);
            }

            info!(
                stage = %stage.name,
                batch = batch.index,
                job_id = outcome.job_id.as_deref().unwrap_or("-"),
                elapsed = %crate::utils::format_elapsed(outcome.elapsed),
                "Stage completed"
            );
            self.events
                .emit(&PipelineEvent::StageCompleted {
                    batch: batch.index,
                    stage: stage.name.clone(),
                    job_id: outcome.job_id.clone(),
                    elapsed_secs: outcome.elapsed.as_secs(),
                })
                .await;
            report.stages.push(StageRecord {
                stage: stage.name.clone(),
                extent: stage.extent.get(),
                job_id: outcome.job_id,
                terminal_state: outcome.terminal_state,
                elapsed: outcome.elapsed,
            });

            let next = stages.get(position + 1).map(|s| s.catalog_index);
            self.transition(self.state().advance(stage.catalog_index, true, next));
        }

        self.transition(DriverState::Completed);
        report.state = DriverState::Completed;
        Ok(report)
    }
}

/// Creates a stage's log directory and removes its logs from earlier
/// batches.
fn prepare_log_dir(dir: &Path, stage: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let prefix = format!("{stage}_");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let stale = name.to_str().is_some_and(|n| n.starts_with(&prefix));
        if stale && entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::session::SessionLayout;
    use crate::testing::RecordingScheduler;
    use pretty_assertions::assert_eq;

    fn driver(
        root: &Path,
        scheduler: Arc<RecordingScheduler>,
        levels: u32,
        projections: bool,
    ) -> PipelineDriver {
        let layout = SessionLayout::new(root.join("scratch"), root.join("durable"), "models");
        layout.ensure_dirs().unwrap();
        PipelineDriver::new(
            StageCatalog::standard().unwrap(),
            ParameterSet::default(),
            PipelineToggles {
                levels,
                projections,
            },
            Arc::new(SessionContext::new(layout, "/opt/pipeline")),
            scheduler,
        )
    }

    fn counts() -> DynamicCounts {
        DynamicCounts::new(12, 4, 3, 2, 2, 6).unwrap()
    }

    #[tokio::test]
    async fn test_runs_included_stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::new());
        let events = Arc::new(CollectingEventSink::new());
        let driver = driver(dir.path(), scheduler.clone(), 1, true).with_event_sink(events.clone());

        let report = driver.run_batch(&Batch::start(1, 1), &counts()).await.unwrap();

        assert_eq!(
            scheduler.stage_names(),
            vec![
                "prepare",
                "global_covsel",
                "global_fit",
                "global_ensemble",
                "global_predict",
                "global_predict_ensemble",
                "evaluate",
            ]
        );
        assert!(report.is_completed());
        assert_eq!(driver.state(), DriverState::Completed);
        assert_eq!(report.skipped.len(), 5);
        assert_eq!(report.job_ids().len(), 7);
        assert_eq!(events.events_of_type("stage.skipped").len(), 5);
        assert_eq!(events.events_of_type("stage.completed").len(), 7);
    }

    #[tokio::test]
    async fn test_extents_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::new());
        let driver = driver(dir.path(), scheduler.clone(), 2, false);

        driver.run_batch(&Batch::start(2, 3), &counts()).await.unwrap();

        let requests = scheduler.requests();
        let fit = requests.iter().find(|r| r.stage_name == "regional_fit").unwrap();
        assert_eq!(fit.extent.get(), 144);
        assert!(fit.array);
        assert!(fit.env.contains(&(BATCH_INDEX_ENV.to_string(), "2".to_string())));

        let prepare = &requests[0];
        assert_eq!(prepare.stage_name, "prepare");
        assert!(!prepare.array);
        assert_eq!(prepare.command, Path::new("/opt/pipeline/prepare.sh"));
    }

    #[tokio::test]
    async fn test_failure_stops_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::new().fail_stage("global_fit"));
        let events = Arc::new(CollectingEventSink::new());
        let driver = driver(dir.path(), scheduler.clone(), 2, true).with_event_sink(events.clone());

        let err = driver.run_batch(&Batch::start(1, 1), &counts()).await.unwrap_err();

        assert_eq!(
            scheduler.stage_names(),
            vec!["prepare", "global_covsel", "global_fit"]
        );
        assert_eq!(driver.state(), DriverState::StageFailed(2));
        match err {
            SdmflowError::StageSubmission(e) => {
                assert_eq!(e.stage, "global_fit");
                assert_eq!(e.batch, Some(1));
                assert_eq!(e.terminal_state, Some(TerminalState::Failed));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(events.events_of_type("stage.failed").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_stage_error() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(RecordingScheduler::new().reject_call(1));
        let driver = driver(dir.path(), scheduler.clone(), 1, false);

        let err = driver.run_batch(&Batch::start(1, 1), &counts()).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("Stage 'prepare' failed in batch 1"));
        assert_eq!(scheduler.calls(), 1);
    }

    #[test]
    fn test_prepare_log_dir_removes_only_own_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("global_fit");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("global_fit_11_1.out"), "old").unwrap();
        std::fs::write(logs.join("notes.txt"), "keep").unwrap();

        prepare_log_dir(&logs, "global_fit").unwrap();
        prepare_log_dir(&dir.path().join("fresh"), "fresh").unwrap();

        assert!(!logs.join("global_fit_11_1.out").exists());
        assert!(logs.join("notes.txt").exists());
        assert!(dir.path().join("fresh").is_dir());
    }
}
