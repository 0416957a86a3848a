//! Core domain model types for sdmflow.
//!
//! This module contains the fundamental types used throughout the driver:
//! - Scheduler terminal states and the driver state machine
//! - Per-batch dynamic counts
//! - Batch records

mod batch;
mod counts;
mod status;

pub use batch::Batch;
pub use counts::DynamicCounts;
pub use status::{DriverState, TerminalState};
