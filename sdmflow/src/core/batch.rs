//! Batch records.

use crate::utils::{compact_timestamp, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One sequential pass of the pipeline over a subset of entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// 1-based batch index.
    pub index: u32,
    /// Total number of batches in the run.
    pub total: u32,
    /// Entities in this batch; zero until the count resolver has run.
    pub entity_count: u32,
    /// When the batch started.
    pub started_at: Timestamp,
}

impl Batch {
    /// Starts batch `index` of `total` now.
    #[must_use]
    pub fn start(index: u32, total: u32) -> Self {
        Self {
            index,
            total,
            entity_count: 0,
            started_at: Utc::now(),
        }
    }

    /// Records the resolved entity count.
    #[must_use]
    pub fn with_entity_count(mut self, entity_count: u32) -> Self {
        self.entity_count = entity_count;
        self
    }

    /// The start time as used in accounting file names.
    #[must_use]
    pub fn start_stamp(&self) -> String {
        compact_timestamp(&self.started_at)
    }
}
