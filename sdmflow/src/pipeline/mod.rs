//! Pipeline driver and run-batcher.
//!
//! The [`PipelineDriver`] runs the included stages of one batch in catalog
//! order, waiting for each array to finish before submitting the next. The
//! [`RunBatcher`] repeats the driver over every batch and archives each one
//! before the next begins.

mod batcher;
mod driver;
mod interfaces;
mod plan;
mod resolver;
mod settings;


pub use batcher::{batch_total, RunBatcher, RunReport};
pub use driver::{BatchReport, PipelineDriver, StageRecord};
pub use interfaces::{BatchArchiver, BatchPipeline, SettingsUpdater};
pub use plan::{ExecutionPlan, PlannedStage};
pub use resolver::CountResolver;
pub use settings::{CommandSettingsUpdater, BATCH_INDEX_ENV, STATE_DIR_ENV};
