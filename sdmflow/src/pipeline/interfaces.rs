//! Seams between the run-batcher and its collaborators.

use super::BatchReport;
use crate::core::{Batch, DynamicCounts};
use crate::errors::SdmflowError;
use crate::sync::ArchiveReport;
use async_trait::async_trait;

/// The external step that selects each batch's entities.
///
/// After [`SettingsUpdater::update`] returns, the entity list and count for
/// the batch are on scratch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsUpdater: Send + Sync {
    /// Splits the entities into batches once per session.
    async fn partition(&self) -> Result<(), SdmflowError>;

    /// Writes the entity selection of `batch`.
    async fn update(&self, batch: &Batch) -> Result<(), SdmflowError>;
}

/// Runs every included stage of one batch.
#[async_trait]
pub trait BatchPipeline: Send + Sync {
    /// Runs the batch; stops at the first stage that does not complete.
    async fn run_batch(
        &self,
        batch: &Batch,
        counts: &DynamicCounts,
    ) -> Result<BatchReport, SdmflowError>;
}

/// Moves a finished batch from scratch to durable storage.
#[async_trait]
pub trait BatchArchiver: Send + Sync {
    /// Archives the batch and, on success, clears scratch.
    async fn archive(
        &self,
        batch: &Batch,
        report: &BatchReport,
    ) -> Result<ArchiveReport, SdmflowError>;
}
