//! Pipeline stages.
//!
//! A stage is one phase of the modeling pipeline, submitted to the scheduler
//! as a single job or a job array. The [`StageCatalog`] lists the stages in
//! execution order; each [`StageDescriptor`] carries the formula its array
//! size is computed from and the predicate deciding whether it runs.

mod catalog;
mod fanout;

pub use catalog::{StageCatalog, StageDescriptor};
pub use fanout::{CountFactor, FanOut, Inclusion, PipelineToggles};
