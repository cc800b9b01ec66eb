//! Per-step counters for monitoring and bottleneck detection.
//!
//! Every step carries a [`StepMonitor`] whose counters are updated with
//! relaxed atomics on the hot path and read at any time, from any thread,
//! as a consistent-enough [`StepStats`] snapshot. A step whose workers are
//! all busy while its upstream reports high blocked time is the stage's
//! bottleneck.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// A point-in-time snapshot of one step's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepStats {
    /// Batches accepted but not yet processed (ingress queue depth).
    pub queued: usize,
    /// Batches fully processed and forwarded (or dropped by a filtering
    /// transform).
    pub done: u64,
    /// Total wall time workers spent inside the transform, summed across
    /// workers.
    pub processing_time: Duration,
    /// Total time this step spent blocked: workers waiting on an empty
    /// ingress queue plus time spent pushing into a full downstream queue.
    pub blocked_time: Duration,
    /// Workers currently running (between start and exit).
    pub workers_in_use: usize,
    /// Configured worker count.
    pub parallelism: usize,
}

/// Live counters behind a step's [`StepStats`] snapshots.
pub struct StepMonitor {
    done: AtomicU64,
    processing_ns: AtomicU64,
    blocked_ns: AtomicU64,
    active_workers: AtomicUsize,
    parallelism: usize,
}

impl StepMonitor {
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self {
            done: AtomicU64::new(0),
            processing_ns: AtomicU64::new(0),
            blocked_ns: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            parallelism,
        }
    }

    pub fn inc_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_processing(&self, elapsed: Duration) {
        self.processing_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn add_blocked(&self, elapsed: Duration) {
        self.blocked_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one worker as exited and return the count before decrementing,
    /// so the last worker out (return value 1) can run step completion.
    pub fn worker_stopped(&self) -> usize {
        self.active_workers.fetch_sub(1, Ordering::AcqRel)
    }

    #[must_use]
    pub fn workers_in_use(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Snapshot the counters. `queued` is supplied by the caller because
    /// queue depth lives in the step's queue, not here.
    #[must_use]
    pub fn snapshot(&self, queued: usize) -> StepStats {
        StepStats {
            queued,
            done: self.done(),
            processing_time: Duration::from_nanos(self.processing_ns.load(Ordering::Relaxed)),
            blocked_time: Duration::from_nanos(self.blocked_ns.load(Ordering::Relaxed)),
            workers_in_use: self.workers_in_use(),
            parallelism: self.parallelism,
        }
    }
}
