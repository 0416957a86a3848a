//! # sdmflow
//!
//! A batched driver for multi-stage species distribution modelling pipelines
//! on Slurm clusters.
//!
//! sdmflow splits the entities of a study into batches and, for each batch:
//!
//! - **Resolves counts**: entities, algorithms, nesting methods, scenarios
//!   and simulation combinations feed the fan-out formula of every stage
//! - **Drives the stages**: each included stage is submitted as one job
//!   array and awaited before the next one starts
//! - **Archives**: fitted models are copied to durable storage first, then
//!   the rest of the output tree, and only then is scratch cleared
//!
//! After the last batch, one aggregation job per entity group is submitted.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sdmflow::prelude::*;
//!
//! let params = ParameterSet::from_file(Path::new("sdmflow.toml"))?;
//! let session = Arc::new(SessionContext::bootstrap(&params)?);
//! let toggles = PipelineToggles::from_params(&params)?;
//! let scheduler: Arc<dyn JobScheduler> = Arc::new(SlurmScheduler::new());
//!
//! let driver = PipelineDriver::new(
//!     StageCatalog::standard()?,
//!     params.clone(),
//!     toggles,
//!     session.clone(),
//!     scheduler.clone(),
//! );
//! let report = RunBatcher::new(session, settings, resolver, Arc::new(driver), archiver)
//!     .run(batch_total(&params, layout)?)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod aggregation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod stages;
pub mod sync;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aggregation::{AggregationReport, AggregationSettings, Aggregator};
    pub use crate::config::{ParameterSet, ResourceProfile, WallTime};
    pub use crate::core::{Batch, DriverState, DynamicCounts, TerminalState};
    pub use crate::errors::{
        AggregationSubmissionError, ConfigurationError, SchedulerError, SdmflowError,
        StageSubmissionError, SyncError, SyncPhase,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::pipeline::{
        batch_total, BatchArchiver, BatchPipeline, CommandSettingsUpdater, CountResolver,
        ExecutionPlan, PipelineDriver, RunBatcher, SettingsUpdater,
    };
    pub use crate::scheduler::{
        DryRunScheduler, JobScheduler, SlurmScheduler, SubmissionOutcome, SubmissionRequest,
        WaitMode,
    };
    pub use crate::session::{SessionContext, SessionLayout};
    pub use crate::stages::{PipelineToggles, StageCatalog, StageDescriptor};
    pub use crate::sync::{ArchiveSettings, Archiver, LocalMirror, Mirror, RsyncMirror};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
