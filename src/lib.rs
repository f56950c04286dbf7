//! # Conveyor
//!
//! Priority-aware, resource-bounded concurrent job processing engine.
//!
//! ## Architecture
//!
//! - **Job**: Immutable identity plus a mutable lifecycle record
//! - **PriorityQueue**: Multi-level FIFO queue, strict highest-priority-first
//! - **ResourceMonitor**: Background sampler gating admission on memory,
//!   CPU, and disk usage
//! - **ConcurrentProcessor**: Dispatch loop, bounded worker pool, bounded
//!   retries, and live metrics
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conveyor::prelude::*;
//!
//! struct Extract;
//!
//! #[async_trait::async_trait]
//! impl JobProcessor for Extract {
//!     async fn process(&self, job: &Job) -> std::result::Result<(), JobError> {
//!         // Do the actual work referenced by job.payload_ref...
//!         Ok(())
//!     }
//! }
//!
//! let processor = ConcurrentProcessor::new(ProcessorConfig::default(), Arc::new(Extract));
//! processor.start();
//! processor.submit(Job::new(JobId::new(), "receipts/1042.png").with_priority(JobPriority::Urgent));
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod queue;

pub use error::{ConveyorError, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::config::{ProcessorConfig, ResourceLimits};
    pub use crate::error::{ConveyorError, Result};
    pub use crate::job::{Job, JobId, JobPriority, JobStatus};
    pub use crate::metrics::ProcessingMetrics;
    pub use crate::monitor::{
        ResourceKind, ResourceMonitor, ResourceRejection, ResourceSnapshot, TelemetryProvider,
    };
    pub use crate::processor::{ConcurrentProcessor, JobError, JobProcessor, QueueStatus};
    pub use crate::queue::PriorityQueue;

    #[cfg(unix)]
    pub use crate::monitor::SystemTelemetry;
}
