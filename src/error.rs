//! Error handling for the processing engine.
//!
//! Crate errors cover the processor's own lifecycle (telemetry, shutdown).
//! Failures inside a single job's execution are deliberately not crate
//! errors: they are captured by the worker and converted into job state and
//! metrics, so no job can affect any other job or the dispatch and monitor
//! loops. Admission denials likewise flow through `submit`'s boolean result
//! and the rejected job's Failed state, not through this type.

use thiserror::Error;

/// A specialized Result type for processor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Errors surfaced by the processing engine itself.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The telemetry provider failed to produce a sample.
    #[error("telemetry sampling failed: {0}")]
    Telemetry(String),

    /// `stop` returned before every in-flight job finished.
    #[error("shutdown drain timed out with {active} job(s) still in flight")]
    ShutdownTimeout {
        /// Jobs still Processing when the drain window closed
        active: usize,
    },
}
