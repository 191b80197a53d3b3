//! Progress reports sent by isolated workers to their owner.

use serde::{Deserialize, Serialize};

/// Coarse lifecycle of a worker loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    #[default]
    Idle,
    Running,
    Draining,
    Closed,
}

/// Counters a worker publishes about itself.
///
/// Reports are cumulative: the newest one replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub phase: WorkerPhase,
    /// Messages handled (frames written or frames located).
    pub processed: u64,
    /// Messages skipped without processing (stale frames, wrong kind).
    pub skipped: u64,
    pub bytes_written: u64,
    /// Bytes currently held in memory waiting for the next flush.
    pub buffered_bytes: u64,
    pub peak_buffered_bytes: u64,
    /// Fatal error that ended the loop, if any.
    pub error: Option<String>,
}

impl WorkerReport {
    /// True once the worker has released its resources.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.phase == WorkerPhase::Closed
    }
}
