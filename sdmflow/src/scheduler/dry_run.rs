//! Dry-run adapter.

use super::{JobScheduler, SlurmScheduler, SubmissionOutcome, SubmissionRequest};
use crate::core::TerminalState;
use crate::errors::SchedulerError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Logs the `sbatch` call each request would make and reports success.
#[derive(Debug, Default)]
pub struct DryRunScheduler {
    renderer: SlurmScheduler,
    next_id: AtomicU64,
}

impl DryRunScheduler {
    /// Creates a dry-run adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests seen so far.
    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl JobScheduler for DryRunScheduler {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn submit(
        &self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionOutcome, SchedulerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let job_id = format!("dry-{id}");
        info!(
            stage = %request.stage_name,
            extent = request.extent.get(),
            command = %format!("sbatch {}", self.renderer.sbatch_args(request).join(" ")),
            env = ?request.env,
            "Dry run: would submit"
        );
        Ok(
            SubmissionOutcome::from_state(TerminalState::Completed, Some(job_id.clone()))
                .with_log_paths(request.log_scheme().resolve(&job_id, request.extent)),
        )
    }

    async fn accounting(&self, job_ids: &[String]) -> Result<String, SchedulerError> {
        Ok(format!("dry run: no accounting for {}\n", job_ids.join(",")))
    }
}
