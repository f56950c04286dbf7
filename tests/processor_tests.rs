//! Integration tests for the concurrent processor.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use conveyor::prelude::*;

// ═══════════════════════════════════════════════════════════════════════════════
// Test Doubles
// ═══════════════════════════════════════════════════════════════════════════════

/// Telemetry whose snapshot the test controls.
struct ControlledTelemetry {
    snapshot: Arc<Mutex<ResourceSnapshot>>,
}

impl TelemetryProvider for ControlledTelemetry {
    fn sample(&mut self) -> Result<ResourceSnapshot> {
        Ok(*self.snapshot.lock())
    }
}

/// Succeeds after a fixed number of failing attempts, counting every call.
struct FlakyProcessor {
    failures: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobProcessor for FlakyProcessor {
    async fn process(&self, _job: &Job) -> std::result::Result<(), JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(JobError::new(format!("transient failure on attempt {call}")))
        } else {
            Ok(())
        }
    }
}

/// Blocks every invocation until the gate opens.
struct GatedProcessor {
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl JobProcessor for GatedProcessor {
    async fn process(&self, _job: &Job) -> std::result::Result<(), JobError> {
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn fast_config(max_workers: usize) -> ProcessorConfig {
    ProcessorConfig {
        max_workers,
        poll_timeout: Duration::from_millis(10),
        resource_backoff: Duration::from_millis(20),
        sample_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn build(
    max_workers: usize,
    hook: Arc<dyn JobProcessor>,
) -> (ConcurrentProcessor, Arc<Mutex<ResourceSnapshot>>) {
    let snapshot = Arc::new(Mutex::new(ResourceSnapshot::default()));
    let processor = ConcurrentProcessor::with_telemetry(
        fast_config(max_workers),
        hook,
        Box::new(ControlledTelemetry {
            snapshot: snapshot.clone(),
        }),
    );
    (processor, snapshot)
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn wait_for_snapshot(processor: &ConcurrentProcessor, memory_mb: f64) {
    wait_until(
        || (processor.queue_status().resource_usage.memory_mb - memory_mb).abs() < f64::EPSILON,
        "monitor to observe the controlled snapshot",
    )
    .await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Semantics
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn retry_then_success_completes_with_two_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let (processor, _) = build(
        2,
        Arc::new(FlakyProcessor {
            failures: 2,
            calls: calls.clone(),
        }),
    );
    processor.start();

    let job = Job::new(JobId::new(), "flaky.png").with_max_retries(3);
    let id = job.id;
    assert!(processor.submit(job));

    wait_until(
        || processor.metrics().completed_jobs == 1,
        "job to complete after retries",
    )
    .await;

    let completed = processor.completed_jobs();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, id);
    assert_eq!(completed[0].status, JobStatus::Completed);
    assert_eq!(completed[0].retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(processor.metrics().failed_jobs, 0);

    processor.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn retry_exhaustion_fails_after_one_initial_plus_max_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let (processor, _) = build(
        2,
        Arc::new(FlakyProcessor {
            failures: u32::MAX,
            calls: calls.clone(),
        }),
    );
    processor.start();

    let job = Job::new(JobId::new(), "doomed.png").with_max_retries(2);
    assert!(processor.submit(job));

    wait_until(
        || processor.metrics().failed_jobs == 1,
        "job to exhaust its retries",
    )
    .await;

    // 1 initial attempt + 2 retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let failed = processor.failed_jobs();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, JobStatus::Failed);
    assert_eq!(failed[0].retry_count, 2);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("transient failure"));

    processor.stop(Duration::from_secs(1)).await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admission Control
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn admission_rejection_never_enqueues_the_job() {
    let calls = Arc::new(AtomicU32::new(0));
    let (processor, snapshot) = build(
        2,
        Arc::new(FlakyProcessor {
            failures: 0,
            calls: calls.clone(),
        }),
    );
    processor.start();

    *snapshot.lock() = ResourceSnapshot {
        memory_mb: 600.0,
        ..Default::default()
    };
    wait_for_snapshot(&processor, 600.0).await;

    let job = Job::new(JobId::new(), "rejected.png");
    let id = job.id;
    assert!(!processor.submit(job));

    let status = processor.queue_status();
    assert_eq!(status.total_size, 0);
    assert_eq!(status.active_jobs, 0);

    // Never dispatched and not counted as accepted work.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(processor.metrics().total_jobs, 0);

    let failed = processor.failed_jobs();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].status, JobStatus::Failed);
    assert!(failed[0].error_message.as_deref().unwrap().contains("memory"));

    processor.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn dispatch_recheck_requeues_until_resources_recover() {
    let calls = Arc::new(AtomicU32::new(0));
    let (processor, snapshot) = build(
        1,
        Arc::new(FlakyProcessor {
            failures: 0,
            calls: calls.clone(),
        }),
    );
    processor.start();

    // Admit the job while resources are fine.
    let job = Job::new(JobId::new(), "delayed.png");
    // Flip the snapshot over the limit right away; the dispatch-time
    // re-check should then hold the job in the queue.
    assert!(processor.submit(job));
    *snapshot.lock() = ResourceSnapshot {
        cpu_percent: 95.0,
        ..Default::default()
    };
    wait_until(
        || processor.queue_status().resource_usage.cpu_percent > 90.0,
        "monitor to observe cpu pressure",
    )
    .await;

    // Recover and expect the queued job to complete.
    *snapshot.lock() = ResourceSnapshot::default();
    wait_until(
        || processor.metrics().completed_jobs == 1,
        "job to complete once resources recover",
    )
    .await;

    processor.stop(Duration::from_secs(1)).await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Priority Scheduling
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn urgent_job_overtakes_queued_normal_jobs() {
    let (gate_tx, gate_rx) = watch::channel(false);
    let (processor, _) = build(1, Arc::new(GatedProcessor { gate: gate_rx }));
    processor.start();

    // Plug the single worker, then let the dispatcher pre-claim a second
    // job; everything submitted after that stays in the queue.
    let plug1 = Job::new(JobId::new(), "plug-1.png");
    let plug2 = Job::new(JobId::new(), "plug-2.png");
    assert!(processor.submit(plug1));
    wait_until(
        || processor.queue_status().active_jobs == 1,
        "first plug job to occupy the worker",
    )
    .await;
    assert!(processor.submit(plug2));
    wait_until(
        || {
            let status = processor.queue_status();
            status.total_size == 0 && status.active_jobs == 1
        },
        "dispatcher to pre-claim the second plug job",
    )
    .await;

    let mut normal_ids = Vec::new();
    for i in 0..5 {
        let job = Job::new(JobId::new(), format!("normal-{i}.png"));
        normal_ids.push(job.id);
        assert!(processor.submit(job));
    }
    let urgent = Job::new(JobId::new(), "urgent.png").with_priority(JobPriority::Urgent);
    let urgent_id = urgent.id;
    assert!(processor.submit(urgent));

    let sizes = processor.queue_status().priority_sizes;
    assert_eq!(sizes[&JobPriority::Normal], 5);
    assert_eq!(sizes[&JobPriority::Urgent], 1);

    gate_tx.send(true).unwrap();
    wait_until(
        || processor.metrics().completed_jobs == 8,
        "all jobs to complete",
    )
    .await;

    // Completion order: the two plugs, then the urgent job, then the
    // normals in FIFO order.
    let completed = processor.completed_jobs();
    assert_eq!(completed[2].id, urgent_id);
    let normal_order: Vec<JobId> = completed[3..].iter().map(|j| j.id).collect();
    assert_eq!(normal_order, normal_ids);

    processor.stop(Duration::from_secs(1)).await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cancellation
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn queued_job_can_be_cancelled_but_active_cannot() {
    let (gate_tx, gate_rx) = watch::channel(false);
    let (processor, _) = build(1, Arc::new(GatedProcessor { gate: gate_rx }));
    processor.start();

    let active = Job::new(JobId::new(), "active.png");
    let active_id = active.id;
    assert!(processor.submit(active));
    wait_until(
        || processor.queue_status().active_jobs == 1,
        "job to reach the worker",
    )
    .await;

    // Pre-claimed by the dispatcher; also not cancellable once taken from
    // the queue.
    let claimed = Job::new(JobId::new(), "claimed.png");
    assert!(processor.submit(claimed));
    wait_until(
        || processor.queue_status().total_size == 0,
        "dispatcher to pre-claim the second job",
    )
    .await;

    let queued = Job::new(JobId::new(), "queued.png");
    let queued_id = queued.id;
    assert!(processor.submit(queued));

    assert!(!processor.cancel(active_id));
    assert!(processor.cancel(queued_id));
    assert!(!processor.cancel(queued_id));

    let status = processor.queue_status();
    assert_eq!(status.total_size, 0);
    assert_eq!(status.cancelled_jobs, 1);
    assert_eq!(processor.metrics().cancelled_jobs, 1);

    gate_tx.send(true).unwrap();
    wait_until(
        || processor.metrics().completed_jobs == 2,
        "remaining jobs to complete",
    )
    .await;

    // The cancelled job never ran.
    let metrics = processor.metrics();
    assert_eq!(metrics.completed_jobs, 2);
    assert!(metrics.finished_jobs() <= metrics.total_jobs);

    processor.stop(Duration::from_secs(1)).await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shutdown
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stop_with_zero_timeout_abandons_in_flight_job() {
    let (_gate_tx, gate_rx) = watch::channel(false);
    let (processor, _) = build(1, Arc::new(GatedProcessor { gate: gate_rx }));
    processor.start();

    let job = Job::new(JobId::new(), "stuck.png");
    let id = job.id;
    assert!(processor.submit(job));
    wait_until(
        || processor.queue_status().active_jobs == 1,
        "job to reach the worker",
    )
    .await;

    let result = processor.stop(Duration::ZERO).await;
    match result {
        Err(ConveyorError::ShutdownTimeout { active }) => assert_eq!(active, 1),
        other => panic!("expected shutdown timeout, got {other:?}"),
    }

    // The abandoned job is still observable as Processing, never silently
    // finalized by stop itself.
    let active = processor.active_jobs();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].status, JobStatus::Processing);

    let metrics = processor.metrics();
    assert_eq!(metrics.completed_jobs, 0);
    assert_eq!(metrics.failed_jobs, 0);
}

#[tokio::test]
async fn stop_drains_completed_work() {
    let calls = Arc::new(AtomicU32::new(0));
    let (processor, _) = build(
        2,
        Arc::new(FlakyProcessor {
            failures: 0,
            calls,
        }),
    );
    processor.start();

    for i in 0..4 {
        assert!(processor.submit(Job::new(JobId::new(), format!("batch-{i}.png"))));
    }
    wait_until(
        || processor.metrics().completed_jobs == 4,
        "batch to complete",
    )
    .await;

    processor.stop(Duration::from_secs(1)).await.unwrap();

    let metrics = processor.metrics();
    assert_eq!(metrics.total_jobs, 4);
    assert_eq!(metrics.completed_jobs, 4);
    assert_eq!(metrics.active_workers, 0);
    assert_eq!(metrics.current_queue_size, 0);
    assert!(metrics.average_processing_time <= metrics.total_processing_time);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Graceful Degradation
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn degradation_shrinks_workers_to_a_floor_of_one() {
    let calls = Arc::new(AtomicU32::new(0));
    let (processor, snapshot) = build(
        3,
        Arc::new(FlakyProcessor {
            failures: 0,
            calls,
        }),
    );
    processor.start();
    assert_eq!(processor.worker_count(), 3);

    // Not under load yet.
    assert!(!processor.graceful_degradation().await);
    assert_eq!(processor.worker_count(), 3);

    // Over the warning threshold but under the hard limit.
    *snapshot.lock() = ResourceSnapshot {
        memory_mb: 450.0,
        ..Default::default()
    };
    wait_for_snapshot(&processor, 450.0).await;

    assert!(processor.graceful_degradation().await);
    assert_eq!(processor.worker_count(), 2);
    assert!(processor.graceful_degradation().await);
    assert_eq!(processor.worker_count(), 1);

    // Floor of one worker; the pool never shrinks to zero.
    assert!(processor.graceful_degradation().await);
    assert_eq!(processor.worker_count(), 1);

    // One-directional: recovering load does not restore workers.
    *snapshot.lock() = ResourceSnapshot::default();
    wait_for_snapshot(&processor, 0.0).await;
    assert!(!processor.graceful_degradation().await);
    assert_eq!(processor.worker_count(), 1);

    processor.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn concurrent_degradation_keeps_the_last_worker_slot() {
    let calls = Arc::new(AtomicU32::new(0));
    let (processor, snapshot) = build(
        2,
        Arc::new(FlakyProcessor {
            failures: 0,
            calls,
        }),
    );
    let processor = Arc::new(processor);
    processor.start();

    *snapshot.lock() = ResourceSnapshot {
        memory_mb: 450.0,
        ..Default::default()
    };
    wait_for_snapshot(&processor, 450.0).await;

    // Two simultaneous callers race for the single available shrink step;
    // exactly one permit may be retired.
    let first = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.graceful_degradation().await })
    };
    let second = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.graceful_degradation().await })
    };
    assert!(first.await.unwrap());
    assert!(second.await.unwrap());
    assert_eq!(processor.worker_count(), 1);

    // The surviving slot still dispatches work (450MB is under the 512MB
    // hard admission limit).
    assert!(processor.submit(Job::new(JobId::new(), "after-shrink.png")));
    wait_until(
        || processor.metrics().completed_jobs == 1,
        "job to run on the remaining worker",
    )
    .await;

    processor.stop(Duration::from_secs(1)).await.unwrap();
}
