//! Processor and resource-limit configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource usage limits and warning thresholds.
///
/// The `max_*` fields are hard admission limits; the `*_threshold` fields
/// are soft warning levels used for graceful degradation, and sit strictly
/// below their hard counterparts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard limit on process memory (MB)
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: f64,

    /// Hard limit on process CPU usage (%)
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,

    /// Hard limit on disk usage of the working volume (%)
    #[serde(default = "default_max_disk_usage_percent")]
    pub max_disk_usage_percent: f64,

    /// Maximum jobs processing at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Memory warning threshold (MB)
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: f64,

    /// CPU warning threshold (%)
    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_disk_usage_percent: default_max_disk_usage_percent(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            memory_threshold_mb: default_memory_threshold_mb(),
            cpu_threshold_percent: default_cpu_threshold_percent(),
        }
    }
}

/// Configuration for the concurrent processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Number of worker slots
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Queue poll window for the dispatch loop; short so shutdown is
    /// observed promptly
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,

    /// Pause before re-polling when dispatch-time admission fails
    #[serde(with = "humantime_serde", default = "default_resource_backoff")]
    pub resource_backoff: Duration,

    /// Resource sampling interval
    #[serde(with = "humantime_serde", default = "default_sample_interval")]
    pub sample_interval: Duration,

    /// Default drain window for `stop`
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Resource limits and thresholds
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_timeout: default_poll_timeout(),
            resource_backoff: default_resource_backoff(),
            sample_interval: default_sample_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            limits: ResourceLimits::default(),
        }
    }
}

fn default_max_memory_mb() -> f64 {
    512.0
}

fn default_max_cpu_percent() -> f64 {
    80.0
}

fn default_max_disk_usage_percent() -> f64 {
    90.0
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_memory_threshold_mb() -> f64 {
    400.0
}

fn default_cpu_threshold_percent() -> f64 {
    70.0
}

fn default_max_workers() -> usize {
    4
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_resource_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_memory_mb, 512.0);
        assert_eq!(limits.max_cpu_percent, 80.0);
        assert_eq!(limits.max_disk_usage_percent, 90.0);
        assert_eq!(limits.max_concurrent_jobs, 4);
        // Warning thresholds sit below the hard limits.
        assert!(limits.memory_threshold_mb < limits.max_memory_mb);
        assert!(limits.cpu_threshold_percent < limits.max_cpu_percent);
    }

    #[test]
    fn test_processor_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.sample_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_deserializes_durations() {
        let config: ProcessorConfig = serde_json::from_str(
            r#"{"max_workers": 2, "poll_timeout": "250ms", "shutdown_timeout": "5s"}"#,
        )
        .unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.limits.max_concurrent_jobs, 4);
    }
}
