//! Multi-level FIFO queue with strict priority ordering.
//!
//! Four buckets, one per [`JobPriority`], served strictly highest-first.
//! Within a bucket, dispatch order matches enqueue order. Waiters park on a
//! [`tokio::sync::Notify`] that is woken on every `put`, then rescan the
//! buckets top-down, rather than polling each bucket with a shrinking
//! timeout.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;

use crate::job::{Job, JobId, JobPriority};

/// Thread-safe priority queue for pending jobs.
pub struct PriorityQueue {
    buckets: Mutex<Buckets>,
    notify: Notify,
}

struct Buckets {
    // Indexed by JobPriority discriminant (Low = 0 .. Urgent = 3).
    queues: [VecDeque<Job>; 4],
    total: usize,
}

impl Buckets {
    fn bucket_mut(&mut self, priority: JobPriority) -> &mut VecDeque<Job> {
        &mut self.queues[priority as usize]
    }
}

impl PriorityQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                queues: Default::default(),
                total: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a job into the bucket matching its priority. O(1).
    pub fn put(&self, job: Job) {
        {
            let mut buckets = self.buckets.lock();
            buckets.bucket_mut(job.priority).push_back(job);
            buckets.total += 1;
        }
        self.notify.notify_one();
    }

    /// Pop the front of the highest non-empty bucket without waiting.
    pub fn try_get(&self) -> Option<Job> {
        let mut buckets = self.buckets.lock();
        for priority in JobPriority::DESCENDING {
            if let Some(job) = buckets.bucket_mut(priority).pop_front() {
                buckets.total -= 1;
                return Some(job);
            }
        }
        None
    }

    /// Pop the highest-priority job, waiting up to `timeout` for one to
    /// arrive. Returns `None` when the queue stays empty for the whole
    /// window.
    pub async fn get(&self, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a put between the check
            // and the wait still wakes us.
            let notified = self.notify.notified();

            if let Some(job) = self.try_get() {
                // Pass the wakeup on in case another waiter has work too.
                self.notify.notify_one();
                return Some(job);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_get();
            }
        }
    }

    /// Remove a queued job by id, regardless of bucket.
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let mut buckets = self.buckets.lock();
        for priority in JobPriority::DESCENDING {
            let bucket = buckets.bucket_mut(priority);
            if let Some(pos) = bucket.iter().position(|j| j.id == id) {
                let job = bucket.remove(pos);
                if job.is_some() {
                    buckets.total -= 1;
                }
                return job;
            }
        }
        None
    }

    /// Total number of queued jobs across all buckets.
    pub fn size(&self) -> usize {
        self.buckets.lock().total
    }

    /// Check whether every bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Per-bucket queue sizes. Taken under the lock, so the values sum to
    /// `size()` at the observation point.
    pub fn priority_sizes(&self) -> BTreeMap<JobPriority, usize> {
        let buckets = self.buckets.lock();
        JobPriority::DESCENDING
            .iter()
            .map(|&p| (p, buckets.queues[p as usize].len()))
            .collect()
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
