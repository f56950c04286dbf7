//! Resource monitoring and admission control.
//!
//! A background task samples memory, CPU, and disk usage on a fixed
//! interval, independent of job throughput. The processor consults the most
//! recent snapshot through two read-only queries:
//!
//! - [`ResourceMonitor::can_process_job`] — hard admission gate
//! - [`ResourceMonitor::is_under_load`] — soft warning gate, used for
//!   graceful degradation
//!
//! The sampling mechanism is a collaborator behind [`TelemetryProvider`];
//! the monitor only consumes three numeric signals. A failed sample is
//! logged and the last-known snapshot is retained, so transient telemetry
//! errors cannot flap admission decisions.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ResourceLimits;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot and Rejection Types
// ═══════════════════════════════════════════════════════════════════════════════

/// The most recently sampled resource figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Process resident memory (MB)
    pub memory_mb: f64,
    /// Process CPU usage (%)
    pub cpu_percent: f64,
    /// Disk usage of the working volume (%)
    pub disk_percent: f64,
}

/// The resource that caused an admission rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Disk,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Cpu => write!(f, "cpu"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// A hard admission denial, naming the limiting resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRejection {
    /// Which limit was exceeded
    pub resource: ResourceKind,
    /// Human-readable reason
    pub message: String,
}

impl ResourceRejection {
    pub fn new(resource: ResourceKind, message: impl Into<String>) -> Self {
        Self {
            resource,
            message: message.into(),
        }
    }
}

impl fmt::Display for ResourceRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Telemetry Provider
// ═══════════════════════════════════════════════════════════════════════════════

/// Boundary to the concrete sampling mechanism.
///
/// Implementations may keep state between calls (CPU usage is a delta over
/// the sampling interval).
pub trait TelemetryProvider: Send {
    /// Take one sample of current resource usage.
    fn sample(&mut self) -> Result<ResourceSnapshot>;
}

/// Default Unix provider: RSS and CPU from `/proc/self`, disk usage via
/// `statvfs` on the working directory.
#[cfg(unix)]
pub struct SystemTelemetry {
    disk_path: std::ffi::CString,
    clock_ticks: f64,
    last_cpu: Option<CpuSample>,
}

#[cfg(unix)]
struct CpuSample {
    taken_at: std::time::Instant,
    total_ticks: u64,
}

#[cfg(unix)]
impl SystemTelemetry {
    /// Create a provider sampling disk usage for the current directory.
    pub fn new() -> Self {
        Self::with_disk_path(".")
    }

    /// Create a provider sampling disk usage for a specific path.
    pub fn with_disk_path(path: &str) -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as f64;
        Self {
            disk_path: std::ffi::CString::new(path).unwrap_or_default(),
            clock_ticks: if clock_ticks > 0.0 { clock_ticks } else { 100.0 },
            last_cpu: None,
        }
    }

    fn memory_mb(&self) -> Result<f64> {
        let status = std::fs::read_to_string("/proc/self/status")
            .map_err(|e| crate::error::ConveyorError::Telemetry(e.to_string()))?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: f64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .map_err(|_| {
                        crate::error::ConveyorError::Telemetry(format!(
                            "unparseable VmRSS line: {line}"
                        ))
                    })?;
                return Ok(kb / 1024.0);
            }
        }
        Err(crate::error::ConveyorError::Telemetry(
            "VmRSS not found in /proc/self/status".into(),
        ))
    }

    fn cpu_percent(&mut self) -> Result<f64> {
        let stat = std::fs::read_to_string("/proc/self/stat")
            .map_err(|e| crate::error::ConveyorError::Telemetry(e.to_string()))?;
        // Fields after the parenthesised comm; utime and stime are fields
        // 14 and 15 of the full line, i.e. 12 and 13 past the comm.
        let after_comm = stat
            .rsplit_once(')')
            .map(|(_, rest)| rest)
            .ok_or_else(|| {
                crate::error::ConveyorError::Telemetry("malformed /proc/self/stat".into())
            })?;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime: u64 = fields
            .get(11)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| crate::error::ConveyorError::Telemetry("missing utime".into()))?;
        let stime: u64 = fields
            .get(12)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| crate::error::ConveyorError::Telemetry("missing stime".into()))?;

        let now = std::time::Instant::now();
        let total_ticks = utime + stime;
        let percent = match self.last_cpu.as_ref() {
            Some(last) => {
                let elapsed = now.duration_since(last.taken_at).as_secs_f64();
                if elapsed > 0.0 {
                    let used = total_ticks.saturating_sub(last.total_ticks) as f64
                        / self.clock_ticks;
                    (used / elapsed) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some(CpuSample {
            taken_at: now,
            total_ticks,
        });
        Ok(percent)
    }

    fn disk_percent(&self) -> Result<f64> {
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(self.disk_path.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(crate::error::ConveyorError::Telemetry(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        if stats.f_blocks == 0 {
            return Ok(0.0);
        }
        let used = stats.f_blocks.saturating_sub(stats.f_bfree) as f64;
        Ok(used / stats.f_blocks as f64 * 100.0)
    }
}

#[cfg(unix)]
impl Default for SystemTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl TelemetryProvider for SystemTelemetry {
    fn sample(&mut self) -> Result<ResourceSnapshot> {
        Ok(ResourceSnapshot {
            memory_mb: self.memory_mb()?,
            cpu_percent: self.cpu_percent()?,
            disk_percent: self.disk_percent()?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource Monitor
// ═══════════════════════════════════════════════════════════════════════════════

struct MonitorState {
    snapshot: RwLock<ResourceSnapshot>,
    peaks: RwLock<(f64, f64)>,
    limits: ResourceLimits,
}

/// Samples resource usage on a fixed interval and answers admission and
/// degradation queries against the latest snapshot.
pub struct ResourceMonitor {
    state: Arc<MonitorState>,
    provider: Arc<Mutex<Box<dyn TelemetryProvider>>>,
    sample_interval: Duration,
    // Present while the sampling task is running.
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ResourceMonitor {
    /// Create a monitor over the given limits and telemetry provider.
    pub fn new(
        limits: ResourceLimits,
        sample_interval: Duration,
        provider: Box<dyn TelemetryProvider>,
    ) -> Self {
        Self {
            state: Arc::new(MonitorState {
                snapshot: RwLock::new(ResourceSnapshot::default()),
                peaks: RwLock::new((0.0, 0.0)),
                limits,
            }),
            provider: Arc::new(Mutex::new(provider)),
            sample_interval,
            running: Mutex::new(None),
        }
    }

    /// Start the sampling loop. Idempotent.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("resource monitoring already started");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = self.state.clone();
        let provider = self.provider.clone();
        let sample_interval = self.sample_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let sample = provider.lock().sample();
                        match sample {
                            Ok(snapshot) => {
                                *state.snapshot.write() = snapshot;
                                let mut peaks = state.peaks.write();
                                peaks.0 = peaks.0.max(snapshot.memory_mb);
                                peaks.1 = peaks.1.max(snapshot.cpu_percent);
                            }
                            Err(e) => {
                                // Keep the stale snapshot; one failed sample
                                // must not kill monitoring or flip admission.
                                warn!(error = %e, "resource sampling failed, retaining last snapshot");
                            }
                        }
                    }
                }
            }
        });

        *running = Some((shutdown_tx, handle));
        info!(interval_ms = sample_interval.as_millis() as u64, "resource monitoring started");
    }

    /// Stop the sampling loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let taken = self.running.lock().take();
        let Some((shutdown_tx, handle)) = taken else {
            debug!("resource monitoring already stopped");
            return;
        };
        let _ = shutdown_tx.send(true);
        let _ = handle.await;
        info!("resource monitoring stopped");
    }

    /// Check whether the sampling loop is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Hard admission gate: memory, then CPU, then disk against the hard
    /// limits.
    pub fn can_process_job(&self) -> std::result::Result<(), ResourceRejection> {
        let snapshot = *self.state.snapshot.read();
        let limits = &self.state.limits;

        if snapshot.memory_mb > limits.max_memory_mb {
            return Err(ResourceRejection::new(
                ResourceKind::Memory,
                format!(
                    "memory usage too high: {:.1}MB > {:.0}MB",
                    snapshot.memory_mb, limits.max_memory_mb
                ),
            ));
        }
        if snapshot.cpu_percent > limits.max_cpu_percent {
            return Err(ResourceRejection::new(
                ResourceKind::Cpu,
                format!(
                    "cpu usage too high: {:.1}% > {:.0}%",
                    snapshot.cpu_percent, limits.max_cpu_percent
                ),
            ));
        }
        if snapshot.disk_percent > limits.max_disk_usage_percent {
            return Err(ResourceRejection::new(
                ResourceKind::Disk,
                format!(
                    "disk usage too high: {:.1}% > {:.0}%",
                    snapshot.disk_percent, limits.max_disk_usage_percent
                ),
            ));
        }
        Ok(())
    }

    /// Soft gate: memory or CPU over its warning threshold.
    pub fn is_under_load(&self) -> bool {
        let snapshot = *self.state.snapshot.read();
        let limits = &self.state.limits;
        snapshot.memory_mb > limits.memory_threshold_mb
            || snapshot.cpu_percent > limits.cpu_threshold_percent
    }

    /// The most recent snapshot.
    pub fn usage(&self) -> ResourceSnapshot {
        *self.state.snapshot.read()
    }

    /// Peak memory (MB) and CPU (%) observed across all samples.
    pub fn peaks(&self) -> (f64, f64) {
        *self.state.peaks.read()
    }
}
