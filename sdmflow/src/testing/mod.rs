//! Testing utilities for sdmflow pipelines.
//!
//! This module provides:
//! - Recording fakes for the scheduler, mirror, archiver and settings step
//! - Sample settings and an on-disk session fixture

mod fixtures;
mod mocks;

pub use fixtures::{sample_params, sample_params_with, TestSession, SAMPLE_CONFIG};
pub use mocks::{RecordingArchiver, RecordingMirror, RecordingScheduler, ScriptedSettingsUpdater};
