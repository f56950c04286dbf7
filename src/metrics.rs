//! Aggregated throughput and queue/worker metrics.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Processing performance metrics.
///
/// Owned by the processor and mutated only under its state lock; callers
/// receive snapshots. Conservation holds after every event:
/// `completed_jobs + failed_jobs + cancelled_jobs <= total_jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    /// Jobs accepted by `submit`
    pub total_jobs: u64,
    /// Jobs that reached Completed
    pub completed_jobs: u64,
    /// Jobs that reached Failed
    pub failed_jobs: u64,
    /// Jobs cancelled while queued
    pub cancelled_jobs: u64,
    /// Sum of wall-clock processing time across completions
    #[serde(with = "humantime_serde")]
    pub total_processing_time: Duration,
    /// `total_processing_time / completed_jobs`, recomputed on every
    /// completion
    #[serde(with = "humantime_serde")]
    pub average_processing_time: Duration,
    /// Highest memory usage observed (MB)
    pub peak_memory_mb: f64,
    /// Highest CPU usage observed (%)
    pub peak_cpu_percent: f64,
    /// Jobs currently queued
    pub current_queue_size: usize,
    /// Jobs currently being processed
    pub active_workers: usize,
}

impl ProcessingMetrics {
    /// Record a successful completion, maintaining the running average.
    pub fn record_completion(&mut self, duration: Duration) {
        self.completed_jobs += 1;
        self.total_processing_time += duration;
        self.average_processing_time = self.total_processing_time / self.completed_jobs as u32;
    }

    /// Terminal jobs of any kind.
    pub fn finished_jobs(&self) -> u64 {
        self.completed_jobs + self.failed_jobs + self.cancelled_jobs
    }
}
