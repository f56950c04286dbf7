//! The concurrent processing engine.
//!
//! `ConcurrentProcessor` composes the [`PriorityQueue`], the
//! [`ResourceMonitor`], and the metrics/active-job registry, and drives a
//! bounded worker pool from a single dispatch loop. The actual unit of work
//! is an injected [`JobProcessor`]; its failures are captured per job and
//! converted into retries or terminal state, never propagated.
//!
//! Concurrency model: one dispatch loop, one sampling loop, and up to
//! `max_workers` worker tasks gated by a semaphore. Shared state sits
//! behind two locks, the queue's and the processor state's; queue reads
//! are taken into locals before the state lock is acquired, so the two are
//! never held at the same time.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::error::{ConveyorError, Result};
use crate::job::{Job, JobId, JobPriority};
use crate::metrics::ProcessingMetrics;
use crate::monitor::{ResourceMonitor, ResourceSnapshot, TelemetryProvider};
use crate::queue::PriorityQueue;

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Hook
// ═══════════════════════════════════════════════════════════════════════════════

/// Error from one execution attempt of a job.
#[derive(Debug, Clone)]
pub struct JobError {
    /// What went wrong, kept as the job's error message when retries run out
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JobError {}

/// The injected unit-of-work callback.
///
/// Invoked once per dispatch attempt, concurrently from multiple workers
/// with distinct jobs. Errors are translated into retry or terminal failure
/// by the processor.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> std::result::Result<(), JobError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Detailed queue and resource status.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Jobs currently queued across all buckets
    pub total_size: usize,
    /// Queued jobs per priority level
    pub priority_sizes: BTreeMap<JobPriority, usize>,
    /// Jobs currently being processed
    pub active_jobs: usize,
    /// Jobs that reached Completed
    pub completed_jobs: usize,
    /// Jobs that reached Failed
    pub failed_jobs: usize,
    /// Jobs cancelled while queued
    pub cancelled_jobs: usize,
    /// Latest resource snapshot
    pub resource_usage: ResourceSnapshot,
    /// Whether a warning threshold is currently exceeded
    pub under_load: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processor State
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything mutated by the dispatch loop and worker completions, behind
/// one lock.
#[derive(Default)]
struct ProcessorState {
    metrics: ProcessingMetrics,
    active_jobs: HashMap<JobId, Job>,
    completed: Vec<Job>,
    failed: Vec<Job>,
    cancelled: Vec<Job>,
}

/// Shared handles the dispatch loop and workers run against.
struct Shared {
    queue: PriorityQueue,
    state: Mutex<ProcessorState>,
    hook: Arc<dyn JobProcessor>,
    slots: Arc<Semaphore>,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Concurrent Processor
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority-aware, resource-bounded concurrent job processor.
pub struct ConcurrentProcessor {
    config: ProcessorConfig,
    shared: Arc<Shared>,
    monitor: Arc<ResourceMonitor>,
    worker_count: AtomicUsize,
    // Present while the dispatch loop is running.
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ConcurrentProcessor {
    /// Create a processor with the default system telemetry provider.
    #[cfg(unix)]
    pub fn new(config: ProcessorConfig, hook: Arc<dyn JobProcessor>) -> Self {
        Self::with_telemetry(config, hook, Box::new(crate::monitor::SystemTelemetry::new()))
    }

    /// Create a processor with an explicit telemetry provider.
    pub fn with_telemetry(
        config: ProcessorConfig,
        hook: Arc<dyn JobProcessor>,
        provider: Box<dyn TelemetryProvider>,
    ) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(
            config.limits.clone(),
            config.sample_interval,
            provider,
        ));
        let shared = Arc::new(Shared {
            queue: PriorityQueue::new(),
            state: Mutex::new(ProcessorState::default()),
            hook,
            slots: Arc::new(Semaphore::new(config.max_workers)),
            worker_tasks: Mutex::new(Vec::new()),
        });
        Self {
            worker_count: AtomicUsize::new(config.max_workers),
            config,
            shared,
            monitor,
            running: Mutex::new(None),
        }
    }

    /// Start resource monitoring and the dispatch loop. Idempotent: a
    /// second call warns and does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("processor is already running");
            return;
        }

        info!(workers = self.config.max_workers, "starting concurrent processor");
        self.monitor.start();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let monitor = self.monitor.clone();
        let poll_timeout = self.config.poll_timeout;
        let resource_backoff = self.config.resource_backoff;

        let handle = tokio::spawn(dispatch_loop(
            shared,
            monitor,
            poll_timeout,
            resource_backoff,
            shutdown_rx,
        ));
        *running = Some((shutdown_tx, handle));

        info!("concurrent processor started");
    }

    /// Check whether the processor has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Signal shutdown, stop the monitor, and drain in-flight workers for
    /// up to `timeout`.
    ///
    /// Jobs that do not finish inside the window are abandoned, not killed:
    /// they stay Processing and are reported through
    /// [`ConveyorError::ShutdownTimeout`] and the active-job count.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let taken = self.running.lock().take();
        let Some((shutdown_tx, dispatch_handle)) = taken else {
            warn!("processor is not running");
            return Ok(());
        };

        info!("stopping concurrent processor");
        let _ = shutdown_tx.send(true);
        self.monitor.stop().await;
        let _ = dispatch_handle.await;

        let deadline = tokio::time::Instant::now() + timeout;
        let handles: Vec<_> = self.shared.worker_tasks.lock().drain(..).collect();
        for handle in handles {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            // A timed-out handle is dropped, which detaches the task; the
            // job keeps running but is no longer waited on.
            let _ = tokio::time::timeout(remaining, handle).await;
        }

        let active = self.shared.state.lock().active_jobs.len();
        if active > 0 {
            warn!(active, "shutdown drain window closed with jobs still in flight");
            return Err(ConveyorError::ShutdownTimeout { active });
        }

        info!("concurrent processor stopped");
        Ok(())
    }

    /// Submit a job for processing. Never blocks.
    ///
    /// The hard admission check runs before enqueueing: a rejected job is
    /// marked Failed with the limiting resource in its error message,
    /// recorded in the failed list, and never queued or dispatched.
    pub fn submit(&self, mut job: Job) -> bool {
        if !self.is_running() {
            error!(job_id = %job.id, "cannot submit, processor is not running");
            return false;
        }

        if let Err(rejection) = self.monitor.can_process_job() {
            warn!(job_id = %job.id, reason = %rejection, "job rejected at admission");
            job.mark_failed(rejection.to_string());
            self.shared.state.lock().failed.push(job);
            return false;
        }

        let id = job.id;
        let priority = job.priority;
        self.shared.queue.put(job);
        let queue_size = self.shared.queue.size();
        {
            let mut state = self.shared.state.lock();
            state.metrics.total_jobs += 1;
            state.metrics.current_queue_size = queue_size;
        }
        info!(job_id = %id, priority = %priority, "job submitted");
        true
    }

    /// Cancel a queued-but-not-dispatched job.
    ///
    /// Jobs already handed to a worker cannot be cancelled; for those this
    /// returns `false`.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(mut job) = self.shared.queue.remove(id) else {
            debug!(job_id = %id, "cancel requested for a job that is not queued");
            return false;
        };
        job.mark_cancelled();
        let queue_size = self.shared.queue.size();
        let mut state = self.shared.state.lock();
        state.metrics.cancelled_jobs += 1;
        state.metrics.current_queue_size = queue_size;
        state.cancelled.push(job);
        info!(job_id = %id, "job cancelled");
        true
    }

    /// Snapshot of the current processing metrics.
    pub fn metrics(&self) -> ProcessingMetrics {
        let (peak_memory_mb, peak_cpu_percent) = self.monitor.peaks();
        let queue_size = self.shared.queue.size();
        let mut state = self.shared.state.lock();
        state.metrics.current_queue_size = queue_size;
        state.metrics.active_workers = state.active_jobs.len();
        state.metrics.peak_memory_mb = peak_memory_mb;
        state.metrics.peak_cpu_percent = peak_cpu_percent;
        state.metrics.clone()
    }

    /// Detailed queue, registry, and resource status.
    pub fn queue_status(&self) -> QueueStatus {
        let total_size = self.shared.queue.size();
        let priority_sizes = self.shared.queue.priority_sizes();
        let state = self.shared.state.lock();
        QueueStatus {
            total_size,
            priority_sizes,
            active_jobs: state.active_jobs.len(),
            completed_jobs: state.completed.len(),
            failed_jobs: state.failed.len(),
            cancelled_jobs: state.cancelled.len(),
            resource_usage: self.monitor.usage(),
            under_load: self.monitor.is_under_load(),
        }
    }

    /// Jobs that reached Completed, in completion order.
    pub fn completed_jobs(&self) -> Vec<Job> {
        self.shared.state.lock().completed.clone()
    }

    /// Jobs that reached Failed (admission rejections included).
    pub fn failed_jobs(&self) -> Vec<Job> {
        self.shared.state.lock().failed.clone()
    }

    /// Jobs currently registered as Processing.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.shared.state.lock().active_jobs.values().cloned().collect()
    }

    /// Current worker-pool size (after any degradation).
    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst)
    }

    /// Shed one worker slot when the soft load thresholds are exceeded.
    ///
    /// Cooperative backpressure: the pool shrinks by one permit down to a
    /// floor of 1 and a short delay is imposed on the caller. The pool is
    /// never grown back automatically.
    pub async fn graceful_degradation(&self) -> bool {
        if !self.monitor.is_under_load() {
            return false;
        }

        warn!("system under load, applying graceful degradation");

        // Concurrent callers race for the same shrink step; only the one
        // whose update lands retires a permit, keeping the floor intact.
        let shrunk = self
            .worker_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count > 1).then(|| count - 1)
            });
        if let Ok(previous) = shrunk {
            let slots = self.shared.slots.clone();
            // Retire a permit as soon as one frees up.
            tokio::spawn(async move {
                if let Ok(permit) = slots.acquire_owned().await {
                    permit.forget();
                }
            });
            info!(workers = previous - 1, "reduced worker pool");
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch Loop
// ═══════════════════════════════════════════════════════════════════════════════

async fn dispatch_loop(
    shared: Arc<Shared>,
    monitor: Arc<ResourceMonitor>,
    poll_timeout: Duration,
    resource_backoff: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            job = shared.queue.get(poll_timeout) => job,
        };
        let Some(job) = job else {
            if *shutdown_rx.borrow() {
                break;
            }
            continue;
        };

        // Conditions may have changed since submission; re-check before
        // occupying a worker slot.
        if let Err(rejection) = monitor.can_process_job() {
            debug!(job_id = %job.id, reason = %rejection, "resources insufficient, re-queueing");
            shared.queue.put(job);
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(resource_backoff) => {}
            }
            continue;
        }

        let permit = tokio::select! {
            _ = shutdown_rx.changed() => {
                shared.queue.put(job);
                break;
            }
            permit = shared.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let mut job = job;
        job.mark_processing();
        let queue_size = shared.queue.size();
        {
            let mut state = shared.state.lock();
            state.active_jobs.insert(job.id, job.clone());
            state.metrics.active_workers = state.active_jobs.len();
            state.metrics.current_queue_size = queue_size;
        }
        debug!(job_id = %job.id, priority = %job.priority, "job dispatched");

        let worker_shared = shared.clone();
        let handle = tokio::spawn(async move {
            run_job(worker_shared, job).await;
            drop(permit);
        });

        let mut tasks = shared.worker_tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

/// Execute one dispatch attempt and fold the outcome into job state and
/// metrics.
async fn run_job(shared: Arc<Shared>, mut job: Job) {
    let start = Instant::now();
    let result = shared.hook.process(&job).await;
    let elapsed = start.elapsed();

    match result {
        Ok(()) => {
            job.mark_completed();
            info!(
                job_id = %job.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "job completed"
            );
            let queue_size = shared.queue.size();
            let mut state = shared.state.lock();
            state.active_jobs.remove(&job.id);
            state.metrics.record_completion(elapsed);
            state.metrics.active_workers = state.active_jobs.len();
            state.metrics.current_queue_size = queue_size;
            state.completed.push(job);
        }
        Err(e) if job.can_retry() => {
            job.reset_for_retry();
            warn!(
                job_id = %job.id,
                attempt = job.retry_count,
                error = %e,
                "job failed, re-queueing for retry"
            );
            {
                let mut state = shared.state.lock();
                state.active_jobs.remove(&job.id);
                state.metrics.active_workers = state.active_jobs.len();
            }
            // Same priority as the original submission; retries never cut
            // ahead of fresh urgent work.
            shared.queue.put(job);
            let queue_size = shared.queue.size();
            shared.state.lock().metrics.current_queue_size = queue_size;
        }
        Err(e) => {
            error!(
                job_id = %job.id,
                retries = job.retry_count,
                error = %e,
                "job failed, retries exhausted"
            );
            job.mark_failed(e.message);
            let queue_size = shared.queue.size();
            let mut state = shared.state.lock();
            state.active_jobs.remove(&job.id);
            state.metrics.failed_jobs += 1;
            state.metrics.active_workers = state.active_jobs.len();
            state.metrics.current_queue_size = queue_size;
            state.failed.push(job);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
