//! Two-phase archival of a finished batch.

use super::accounting::record_accounting;
use super::exclude::ExcludeList;
use super::mirror::{Mirror, MirrorStats};
use super::scratch::clear_subtree;
use crate::config::ParameterSet;
use crate::core::Batch;
use crate::errors::{ConfigurationError, SdmflowError, SyncError, SyncPhase};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::pipeline::{BatchArchiver, BatchReport};
use crate::scheduler::JobScheduler;
use crate::session::SessionContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

/// What to archive and whether to clear scratch afterwards.
#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    /// File-name suffixes of fitted model objects.
    pub model_suffixes: Vec<String>,
    /// Paths the bulk phase leaves on scratch.
    pub excludes: ExcludeList,
    /// Clear scratch output and tmp after both phases.
    pub clear_scratch: bool,
}

impl ArchiveSettings {
    /// Reads `sync.model_suffixes`, `sync.exclude` and `sync.clear_scratch`.
    ///
    /// Without explicit suffixes, each algorithm `a` contributes `_a.rds`.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is malformed.
    pub fn from_params(params: &ParameterSet) -> Result<Self, ConfigurationError> {
        let model_suffixes = match params.optional_list("sync.model_suffixes")? {
            Some(suffixes) => suffixes,
            None => params
                .optional_list("algorithms")?
                .map(|algorithms| algorithms.iter().map(|a| format!("_{a}.rds")).collect())
                .unwrap_or_else(|| vec![".rds".to_string()]),
        };
        if model_suffixes.iter().any(String::is_empty) {
            return Err(ConfigurationError::invalid(
                "sync.model_suffixes",
                "suffixes must not be empty",
            ));
        }

        Ok(Self {
            model_suffixes,
            excludes: ExcludeList::new(params.delimited_list("sync.exclude", ',')?)?,
            clear_scratch: params.flag("sync.clear_scratch", true)?,
        })
    }
}

/// Outcome of archiving one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReport {
    /// 1-based batch index.
    pub batch: u32,
    /// Files listed in the manifest.
    pub manifest_entries: usize,
    /// Selective phase counters.
    pub selective: MirrorStats,
    /// Bulk phase counters.
    pub bulk: MirrorStats,
    /// Whether scratch was cleared.
    pub cleared: bool,
    /// Accounting log, if it could be written.
    pub accounting_log: Option<PathBuf>,
}

/// Copies a batch's outputs to durable storage, then clears scratch.
///
/// Phase one copies the fitted model objects listed in the manifest; phase
/// two mirrors the rest of the output tree minus exclusions. Scratch is only
/// cleared after both succeed.
pub struct Archiver {
    session: Arc<SessionContext>,
    settings: ArchiveSettings,
    mirror: Arc<dyn Mirror>,
    scheduler: Arc<dyn JobScheduler>,
    events: Arc<dyn EventSink>,
    dry_run: bool,
}

impl std::fmt::Debug for Archiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archiver")
            .field("settings", &self.settings)
            .field("mirror", &self.mirror.name())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl Archiver {
    /// Creates an archiver.
    #[must_use]
    pub fn new(
        session: Arc<SessionContext>,
        settings: ArchiveSettings,
        mirror: Arc<dyn Mirror>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            session,
            settings,
            mirror,
            scheduler,
            events: Arc::new(NoOpEventSink),
            dry_run: false,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Leaves scratch untouched.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Fitted model objects under the finished-models tree, relative to the
    /// scratch output root, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be walked.
    pub fn collect_models(&self) -> std::io::Result<Vec<PathBuf>> {
        let output = self.session.layout().output_dir();
        let models = self.session.layout().finished_models_dir();
        if !models.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&models).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if self.settings.model_suffixes.iter().any(|s| name.ends_with(s.as_str())) {
                if let Ok(rel) = entry.path().strip_prefix(&output) {
                    files.push(rel.to_path_buf());
                }
            }
        }
        Ok(files)
    }

    async fn failed(&self, batch: u32, phase: SyncPhase, message: String) -> SdmflowError {
        warn!(batch, %phase, error = %message, "Archival phase failed; scratch left in place");
        self.events
            .emit(&PipelineEvent::SyncFailed {
                batch,
                phase,
                error: message.clone(),
            })
            .await;
        SyncError::new(phase, message).with_batch(batch).into()
    }

    async fn started(&self, batch: u32, phase: SyncPhase) {
        self.events
            .emit(&PipelineEvent::SyncStarted { batch, phase })
            .await;
    }

    async fn completed(&self, batch: u32, phase: SyncPhase, files: u64) {
        info!(batch, %phase, files, "Archival phase completed");
        self.events
            .emit(&PipelineEvent::SyncCompleted {
                batch,
                phase,
                files,
            })
            .await;
    }

    async fn selective(&self, batch: u32) -> Result<(usize, MirrorStats), SdmflowError> {
        let layout = self.session.layout();
        self.started(batch, SyncPhase::Selective).await;

        let files = match self.collect_models() {
            Ok(files) => files,
            Err(e) => {
                return Err(self
                    .failed(batch, SyncPhase::Selective, format!("cannot list models: {e}"))
                    .await)
            }
        };
        if let Err(e) = write_manifest(&layout.manifest_file(), &files) {
            return Err(self
                .failed(batch, SyncPhase::Selective, format!("cannot write manifest: {e}"))
                .await);
        }

        let stats = if files.is_empty() {
            warn!(batch, dir = %layout.finished_models_dir().display(), "No fitted models found");
            MirrorStats::default()
        } else {
            match self
                .mirror
                .copy_listed(
                    &layout.output_dir(),
                    &layout.durable_output_dir(),
                    &files,
                    &layout.manifest_file(),
                )
                .await
            {
                Ok(stats) => stats,
                Err(e) => return Err(self.failed(batch, SyncPhase::Selective, e.to_string()).await),
            }
        };
        self.completed(batch, SyncPhase::Selective, stats.copied).await;
        Ok((files.len(), stats))
    }

    async fn bulk(&self, batch: u32) -> Result<MirrorStats, SdmflowError> {
        let layout = self.session.layout();
        self.started(batch, SyncPhase::Bulk).await;

        if let Err(e) = self.settings.excludes.write_to(&layout.exclude_file()) {
            return Err(self
                .failed(batch, SyncPhase::Bulk, format!("cannot write exclusions: {e}"))
                .await);
        }
        match self
            .mirror
            .mirror_tree(
                &layout.output_dir(),
                &layout.durable_output_dir(),
                &self.settings.excludes,
                &layout.exclude_file(),
            )
            .await
        {
            Ok(stats) => {
                self.completed(batch, SyncPhase::Bulk, stats.copied).await;
                Ok(stats)
            }
            Err(e) => Err(self.failed(batch, SyncPhase::Bulk, e.to_string()).await),
        }
    }

    async fn cleanup(&self, batch: u32) -> Result<bool, SdmflowError> {
        if self.dry_run || !self.settings.clear_scratch {
            info!(batch, dry_run = self.dry_run, "Scratch kept");
            return Ok(false);
        }
        let layout = self.session.layout();
        self.started(batch, SyncPhase::Cleanup).await;
        let mut removed = 0;
        for dir in [layout.output_dir(), layout.tmp_dir()] {
            match clear_subtree(&dir) {
                Ok(n) => removed += n,
                Err(e) => {
                    return Err(self
                        .failed(
                            batch,
                            SyncPhase::Cleanup,
                            format!("cannot clear {}: {e}", dir.display()),
                        )
                        .await)
                }
            }
        }
        self.completed(batch, SyncPhase::Cleanup, removed as u64).await;
        Ok(true)
    }
}

fn write_manifest(path: &Path, files: &[PathBuf]) -> std::io::Result<()> {
    let mut body = String::new();
    for file in files {
        body.push_str(&file.to_string_lossy());
        body.push('\n');
    }
    std::fs::write(path, body)
}

#[async_trait]
impl BatchArchiver for Archiver {
    async fn archive(
        &self,
        batch: &Batch,
        report: &BatchReport,
    ) -> Result<ArchiveReport, SdmflowError> {
        let accounting_log =
            record_accounting(self.scheduler.as_ref(), &self.session, batch, report).await;

        let (manifest_entries, selective) = self.selective(batch.index).await?;
        let bulk = self.bulk(batch.index).await?;
        let cleared = self.cleanup(batch.index).await?;

        info!(
            batch = batch.index,
            models = manifest_entries,
            copied = bulk.copied,
            cleared,
            "Batch archived"
        );
        Ok(ArchiveReport {
            batch: batch.index,
            manifest_entries,
            selective,
            bulk,
            cleared,
            accounting_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::session::SessionLayout;
    use crate::sync::LocalMirror;
    use crate::testing::{RecordingMirror, RecordingScheduler};
    use pretty_assertions::assert_eq;

    fn session(root: &Path) -> Arc<SessionContext> {
        let layout = SessionLayout::new(root.join("scratch"), root.join("durable"), "finished_models");
        layout.ensure_dirs().unwrap();
        let output = layout.output_dir();
        for (rel, body) in [
            ("finished_models/sp1/sp1_glm.rds", "glm"),
            ("finished_models/sp1/sp1_rf.rds", "rf"),
            ("finished_models/sp1/sp1_rf.log", "log"),
            ("maps/sp1.tif", "map"),
            ("maps/sp1.tif.aux.xml", "aux"),
        ] {
            let path = output.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        std::fs::write(layout.tmp_dir().join("scratch.bin"), "tmp").unwrap();
        Arc::new(SessionContext::new(layout, "/opt/pipeline"))
    }

    fn settings() -> ArchiveSettings {
        let params = ParameterSet::from_toml(
            "algorithms = [\"glm\", \"rf\"]\n[sync]\nexclude = \"*.aux.xml, tmp/\"\n",
        )
        .unwrap();
        ArchiveSettings::from_params(&params).unwrap()
    }

    fn completed_report() -> BatchReport {
        let mut report = BatchReport::new(1);
        report.state = crate::core::DriverState::Completed;
        report
    }

    #[test]
    fn test_settings_defaults() {
        let s = settings();
        assert_eq!(s.model_suffixes, vec!["_glm.rds", "_rf.rds"]);
        assert_eq!(s.excludes.patterns().collect::<Vec<_>>(), vec!["*.aux.xml", "tmp/"]);
        assert!(s.clear_scratch);
    }

    #[tokio::test]
    async fn test_archive_copies_then_clears() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let events = Arc::new(CollectingEventSink::new());
        let archiver = Archiver::new(
            session.clone(),
            settings(),
            Arc::new(LocalMirror),
            Arc::new(RecordingScheduler::new()),
        )
        .with_event_sink(events.clone());

        let report = archiver
            .archive(&Batch::start(1, 2), &completed_report())
            .await
            .unwrap();

        let layout = session.layout();
        let manifest = std::fs::read_to_string(layout.manifest_file()).unwrap();
        assert_eq!(
            manifest,
            "finished_models/sp1/sp1_glm.rds\nfinished_models/sp1/sp1_rf.rds\n"
        );
        assert_eq!(report.manifest_entries, 2);
        let durable = layout.durable_output_dir();
        assert!(durable.join("finished_models/sp1/sp1_rf.rds").is_file());
        assert!(durable.join("finished_models/sp1/sp1_rf.log").is_file());
        assert!(durable.join("maps/sp1.tif").is_file());
        assert!(!durable.join("maps/sp1.tif.aux.xml").exists());

        assert!(report.cleared);
        assert_eq!(std::fs::read_dir(layout.output_dir()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(layout.tmp_dir()).unwrap().count(), 0);
        assert!(layout.state_dir().join("finished_models.manifest").is_file());
        assert!(report.accounting_log.is_some());
        assert_eq!(
            events.event_types(),
            vec![
                "sync.started",
                "sync.completed",
                "sync.started",
                "sync.completed",
                "sync.started",
                "sync.completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_selective_failure_skips_bulk_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let mirror = Arc::new(RecordingMirror::new().fail_phase(SyncPhase::Selective));
        let archiver = Archiver::new(
            session.clone(),
            settings(),
            mirror.clone(),
            Arc::new(RecordingScheduler::new()),
        );

        let err = archiver
            .archive(&Batch::start(1, 1), &completed_report())
            .await
            .unwrap_err();

        match err {
            SdmflowError::Sync(e) => {
                assert_eq!(e.phase, SyncPhase::Selective);
                assert_eq!(e.batch, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mirror.calls(), vec![SyncPhase::Selective]);
        assert!(session.layout().output_dir().join("maps/sp1.tif").is_file());
        assert!(session.layout().tmp_dir().join("scratch.bin").is_file());
    }

    #[tokio::test]
    async fn test_bulk_failure_leaves_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let mirror = Arc::new(RecordingMirror::new().fail_phase(SyncPhase::Bulk));
        let archiver = Archiver::new(
            session.clone(),
            settings(),
            mirror.clone(),
            Arc::new(RecordingScheduler::new()),
        );

        let err = archiver
            .archive(&Batch::start(1, 1), &completed_report())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(mirror.calls(), vec![SyncPhase::Selective, SyncPhase::Bulk]);
        assert!(session.layout().output_dir().join("maps/sp1.tif").is_file());
    }

    #[tokio::test]
    async fn test_dry_run_keeps_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let archiver = Archiver::new(
            session.clone(),
            settings(),
            Arc::new(RecordingMirror::new()),
            Arc::new(RecordingScheduler::new()),
        )
        .with_dry_run(true);

        let report = archiver
            .archive(&Batch::start(1, 1), &completed_report())
            .await
            .unwrap();
        assert!(!report.cleared);
        assert!(session.layout().tmp_dir().join("scratch.bin").is_file());
    }
}
