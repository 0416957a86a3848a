//! The run-batcher.

use super::interfaces::{BatchArchiver, BatchPipeline, SettingsUpdater};
use super::resolver::CountResolver;
use super::BatchReport;
use crate::config::ParameterSet;
use crate::core::Batch;
use crate::errors::{ConfigurationError, SdmflowError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::session::{SessionContext, SessionLayout};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Batches in the run.
    pub total_batches: u32,
    /// First batch executed by this invocation.
    pub start_batch: u32,
    /// One report per completed batch.
    pub batches: Vec<BatchReport>,
    /// When the run started.
    pub started_at: Timestamp,
}

/// Reads the number of batches.
///
/// The partition step's `n_batches.txt` wins over the `n_batches` setting.
///
/// # Errors
///
/// Returns an error if neither source gives a positive count, or if
/// `n_batches.txt` exists but cannot be read or parsed.
pub fn batch_total(params: &ParameterSet, layout: &SessionLayout) -> Result<u32, ConfigurationError> {
    let path = layout.batch_count();
    let total = match std::fs::read_to_string(&path) {
        Ok(raw) => raw.trim().parse::<u32>().map_err(|_| {
            ConfigurationError::new(format!(
                "{} holds '{}', not a batch count",
                path.display(),
                raw.trim()
            ))
        })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => params.require_u32("n_batches")?,
        Err(e) => {
            return Err(ConfigurationError::new(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };
    if total == 0 {
        return Err(ConfigurationError::invalid("n_batches", "must be at least 1"));
    }
    Ok(total)
}

/// Repeats the pipeline over every batch, strictly one after another.
///
/// Each batch: write the batch marker, run the settings-update step,
/// resolve counts, run the stages, archive. The first error ends the run.
pub struct RunBatcher {
    session: Arc<SessionContext>,
    settings: Arc<dyn SettingsUpdater>,
    resolver: CountResolver,
    pipeline: Arc<dyn BatchPipeline>,
    archiver: Arc<dyn BatchArchiver>,
    events: Arc<dyn EventSink>,
    start_batch: u32,
}

impl std::fmt::Debug for RunBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunBatcher")
            .field("session_id", &self.session.session_id())
            .field("resolver", &self.resolver)
            .field("start_batch", &self.start_batch)
            .finish_non_exhaustive()
    }
}

impl RunBatcher {
    /// Creates a batcher starting at batch 1.
    #[must_use]
    pub fn new(
        session: Arc<SessionContext>,
        settings: Arc<dyn SettingsUpdater>,
        resolver: CountResolver,
        pipeline: Arc<dyn BatchPipeline>,
        archiver: Arc<dyn BatchArchiver>,
    ) -> Self {
        Self {
            session,
            settings,
            resolver,
            pipeline,
            archiver,
            events: Arc::new(NoOpEventSink),
            start_batch: 1,
        }
    }

    /// Resumes at a later batch (1-based).
    #[must_use]
    pub fn with_start_batch(mut self, start_batch: u32) -> Self {
        self.start_batch = start_batch;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Runs batches `start_batch..=total`.
    ///
    /// The partition step runs first, and only when starting from batch 1.
    ///
    /// # Errors
    ///
    /// Returns the first error of any step; later batches never start.
    pub async fn run(&self, total: u32) -> Result<RunReport, SdmflowError> {
        self.check_range(total)?;
        self.partition_if_fresh().await?;
        self.run_batches(total).await
    }

    /// Like [`RunBatcher::run`], with the batch count read after the
    /// partition step has written it.
    ///
    /// # Errors
    ///
    /// Returns the first error of any step; later batches never start.
    pub async fn run_session(&self, params: &ParameterSet) -> Result<RunReport, SdmflowError> {
        self.partition_if_fresh().await?;
        let total = batch_total(params, self.session.layout())?;
        self.check_range(total)?;
        self.run_batches(total).await
    }

    fn check_range(&self, total: u32) -> Result<(), ConfigurationError> {
        if total == 0 {
            return Err(ConfigurationError::invalid("n_batches", "must be at least 1"));
        }
        if self.start_batch == 0 || self.start_batch > total {
            return Err(ConfigurationError::invalid(
                "start_batch",
                format!("must be between 1 and {total}, got {}", self.start_batch),
            ));
        }
        Ok(())
    }

    async fn partition_if_fresh(&self) -> Result<(), SdmflowError> {
        if self.start_batch == 1 {
            info!("Partitioning entities into batches");
            self.settings.partition().await?;
        }
        Ok(())
    }

    async fn run_batches(&self, total: u32) -> Result<RunReport, SdmflowError> {
        let mut report = RunReport {
            total_batches: total,
            start_batch: self.start_batch,
            batches: Vec::new(),
            started_at: now_utc(),
        };

        for index in self.start_batch..=total {
            let batch = Batch::start(index, total);
            match self.run_one(batch).await {
                Ok(batch_report) => report.batches.push(batch_report),
                Err(e) => {
                    error!(batch = index, total, error = %e, "Batch failed; aborting the run");
                    self.events
                        .emit(&PipelineEvent::BatchFailed {
                            batch: index,
                            error: e.to_string(),
                        })
                        .await;
                    return Err(e);
                }
            }
        }

        info!(
            batches = report.batches.len(),
            session_id = %self.session.session_id(),
            "All batches completed"
        );
        Ok(report)
    }

    async fn run_one(&self, batch: Batch) -> Result<BatchReport, SdmflowError> {
        let started = Instant::now();
        let layout = self.session.layout();

        layout.write_batch_marker(batch.index)?;
        layout.clear_batch_entities()?;
        info!(batch = batch.index, total = batch.total, "Starting batch");
        self.events
            .emit(&PipelineEvent::BatchStarted {
                batch: batch.index,
                total: batch.total,
            })
            .await;

        self.settings.update(&batch).await?;
        let counts = self.resolver.resolve(layout)?;
        let batch = batch.with_entity_count(counts.entities);
        info!(batch = batch.index, entities = counts.entities, "Batch entities selected");

        let report = self.pipeline.run_batch(&batch, &counts).await?;
        self.archiver.archive(&batch, &report).await?;

        self.events
            .emit(&PipelineEvent::BatchCompleted {
                batch: batch.index,
                elapsed_secs: started.elapsed().as_secs(),
            })
            .await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DriverState, DynamicCounts};
    use crate::errors::StageSubmissionError;
    use crate::pipeline::interfaces::MockSettingsUpdater;
    use crate::testing::{RecordingArchiver, ScriptedSettingsUpdater};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Fails the given batch, records the rest.
    #[derive(Default)]
    struct FakePipeline {
        fail_batch: Option<u32>,
        seen: Mutex<Vec<(u32, u32)>>,
    }

    #[async_trait]
    impl BatchPipeline for FakePipeline {
        async fn run_batch(
            &self,
            batch: &Batch,
            counts: &DynamicCounts,
        ) -> Result<BatchReport, SdmflowError> {
            self.seen.lock().push((batch.index, counts.entities));
            if self.fail_batch == Some(batch.index) {
                return Err(StageSubmissionError::new("global_fit", "boom")
                    .with_batch(batch.index)
                    .into());
            }
            let mut report = BatchReport::new(batch.index);
            report.state = DriverState::Completed;
            Ok(report)
        }
    }

    fn setup(root: &std::path::Path) -> (Arc<SessionContext>, CountResolver) {
        let layout = SessionLayout::new(root.join("scratch"), root.join("durable"), "models");
        layout.ensure_dirs().unwrap();
        let session = Arc::new(SessionContext::new(layout, "/opt/pipeline"));
        let params = ParameterSet::from_toml("algorithms = [\"glm\"]\n").unwrap();
        let toggles = crate::stages::PipelineToggles {
            levels: 1,
            projections: false,
        };
        let resolver = CountResolver::new(&params, &toggles, &session).unwrap();
        (session, resolver)
    }

    #[tokio::test]
    async fn test_failure_in_batch_two_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (session, resolver) = setup(dir.path());
        let settings = Arc::new(ScriptedSettingsUpdater::new(session.layout().clone(), 5));
        let pipeline = Arc::new(FakePipeline {
            fail_batch: Some(2),
            ..FakePipeline::default()
        });
        let archiver = Arc::new(RecordingArchiver::new());

        let batcher = RunBatcher::new(
            session.clone(),
            settings.clone(),
            resolver,
            pipeline.clone(),
            archiver.clone(),
        );
        let err = batcher.run(3).await.unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert_eq!(*pipeline.seen.lock(), vec![(1, 5), (2, 5)]);
        assert_eq!(archiver.archived(), vec![1]);
        assert_eq!(settings.updates(), vec![1, 2]);
        assert_eq!(session.layout().read_batch_marker().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resume_skips_partition_and_early_batches() {
        let dir = tempfile::tempdir().unwrap();
        let (session, resolver) = setup(dir.path());
        let layout = session.layout().clone();

        let mut settings = MockSettingsUpdater::new();
        settings.expect_partition().times(0);
        settings.expect_update().times(2).returning(move |batch| {
            std::fs::write(layout.entity_list(), format!("sp{}\n", batch.index))?;
            Ok(())
        });

        let pipeline = Arc::new(FakePipeline::default());
        let archiver = Arc::new(RecordingArchiver::new());
        let batcher = RunBatcher::new(
            session,
            Arc::new(settings),
            resolver,
            pipeline.clone(),
            archiver.clone(),
        )
        .with_start_batch(2);

        let report = batcher.run(3).await.unwrap();
        assert_eq!(report.batches.len(), 2);
        assert_eq!(*pipeline.seen.lock(), vec![(2, 1), (3, 1)]);
        assert_eq!(archiver.archived(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_session_reads_count_written_by_partition() {
        let dir = tempfile::tempdir().unwrap();
        let (session, resolver) = setup(dir.path());
        let layout = session.layout().clone();
        let count_file = layout.batch_count();

        let mut settings = MockSettingsUpdater::new();
        settings.expect_partition().times(1).returning(move || {
            std::fs::write(&count_file, "2\n")?;
            Ok(())
        });
        settings.expect_update().times(2).returning(move |batch| {
            std::fs::write(layout.entity_list(), format!("sp{}\n", batch.index))?;
            Ok(())
        });

        let archiver = Arc::new(RecordingArchiver::new());
        let batcher = RunBatcher::new(
            session,
            Arc::new(settings),
            resolver,
            Arc::new(FakePipeline::default()),
            archiver.clone(),
        );
        let params = ParameterSet::from_toml("n_batches = 9\n").unwrap();

        let report = batcher.run_session(&params).await.unwrap();
        assert_eq!(report.total_batches, 2);
        assert_eq!(archiver.archived(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_archive_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (session, resolver) = setup(dir.path());
        let settings = Arc::new(ScriptedSettingsUpdater::new(session.layout().clone(), 2));
        let pipeline = Arc::new(FakePipeline::default());
        let archiver = Arc::new(RecordingArchiver::new().fail_batch(1));

        let batcher = RunBatcher::new(session, settings, resolver, pipeline.clone(), archiver);
        let err = batcher.run(2).await.unwrap_err();

        assert_eq!(err.exit_code(), 4);
        assert_eq!(pipeline.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_start_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (session, resolver) = setup(dir.path());
        let batcher = RunBatcher::new(
            session.clone(),
            Arc::new(ScriptedSettingsUpdater::new(session.layout().clone(), 1)),
            resolver,
            Arc::new(FakePipeline::default()),
            Arc::new(RecordingArchiver::new()),
        )
        .with_start_batch(4);
        assert_eq!(batcher.run(3).await.unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_batch_total_sources() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path().join("s"), dir.path().join("d"), "m");
        layout.ensure_dirs().unwrap();

        let params = ParameterSet::from_toml("n_batches = 4\n").unwrap();
        assert_eq!(batch_total(&params, &layout).unwrap(), 4);

        std::fs::write(layout.batch_count(), "7\n").unwrap();
        assert_eq!(batch_total(&params, &layout).unwrap(), 7);

        std::fs::write(layout.batch_count(), "0\n").unwrap();
        assert!(batch_total(&params, &layout).is_err());
    }

    #[test]
    fn test_batch_total_unreadable_count_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path().join("s"), dir.path().join("d"), "m");
        layout.ensure_dirs().unwrap();
        let params = ParameterSet::from_toml("n_batches = 4\n").unwrap();

        std::fs::write(layout.batch_count(), "three\n").unwrap();
        assert!(batch_total(&params, &layout).is_err());

        std::fs::remove_file(layout.batch_count()).unwrap();
        std::fs::create_dir(layout.batch_count()).unwrap();
        let err = batch_total(&params, &layout).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    /// Writes the entity list for the first batch only.
    struct FirstBatchOnlyUpdater {
        layout: SessionLayout,
    }

    #[async_trait]
    impl SettingsUpdater for FirstBatchOnlyUpdater {
        async fn partition(&self) -> Result<(), SdmflowError> {
            Ok(())
        }

        async fn update(&self, batch: &Batch) -> Result<(), SdmflowError> {
            if batch.index == 1 {
                std::fs::write(self.layout.entity_list(), "sp1\nsp2\nsp3\nsp4\nsp5\n")?;
                std::fs::write(self.layout.entity_count(), "5\n")?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_previous_batch_entity_list_is_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (session, resolver) = setup(dir.path());
        let settings = Arc::new(FirstBatchOnlyUpdater {
            layout: session.layout().clone(),
        });
        let pipeline = Arc::new(FakePipeline::default());
        let archiver = Arc::new(RecordingArchiver::new());

        let batcher = RunBatcher::new(
            session,
            settings,
            resolver,
            pipeline.clone(),
            archiver.clone(),
        );
        let err = batcher.run(2).await.unwrap_err();

        assert_eq!(err.exit_code(), 2);
        assert_eq!(*pipeline.seen.lock(), vec![(1, 5)]);
        assert_eq!(archiver.archived(), vec![1]);
    }
}
