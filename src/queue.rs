//! Fixed-capacity blocking queue for per-step backpressure.
//!
//! Each processing step owns one [`BoundedQueue`] holding batches that were
//! accepted from upstream but not yet processed. The capacity is the step's
//! "work-ahead" limit: it bounds how far upstream may run ahead of this
//! step's workers, and therefore bounds peak memory independent of the
//! relative speeds of neighboring steps.
//!
//! All blocking operations are interruptible: [`BoundedQueue::close`] wakes
//! every thread parked in [`push`](BoundedQueue::push) or
//! [`pop`](BoundedQueue::pop) with a distinguished `Closed` outcome, so a
//! panicking pipeline can never deadlock on a full or empty queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of a [`BoundedQueue::push`].
#[derive(Debug)]
pub enum PushResult {
    /// The item was accepted. `waited` is the time spent blocked on a full
    /// queue before a slot freed (zero if the queue had room).
    Accepted {
        /// Time spent blocked waiting for capacity.
        waited: Duration,
    },
    /// The queue was closed; the item was dropped.
    Closed,
}

/// Outcome of a [`BoundedQueue::pop`].
#[derive(Debug)]
pub enum PopResult<T> {
    /// An item was dequeued.
    Item(T),
    /// The queue is empty and [`BoundedQueue::finish`] was called: no more
    /// items will ever arrive.
    Finished,
    /// The queue was closed; pending items were discarded.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accepting pushes and pops.
    Open,
    /// No more pushes; pops drain the backlog, then report `Finished`.
    Finished,
    /// Cancelled; backlog discarded, all operations report `Closed`.
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    state: State,
}

/// A fixed-capacity FIFO with blocking, cancellation-aware push and pop.
///
/// Shutdown has two distinct modes:
///
/// - [`finish`](Self::finish) - graceful: no more pushes are expected, but
///   poppers drain the remaining backlog before seeing
///   [`PopResult::Finished`].
/// - [`close`](Self::close) - cancellation: the backlog is discarded and
///   every blocked pusher and popper wakes immediately (fail-fast, not
///   best-effort).
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(Inner { items: VecDeque::with_capacity(capacity), state: State::Open }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// The fixed capacity this queue was constructed with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Returns true if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Enqueue an item, blocking while the queue is at capacity.
    ///
    /// Returns the time spent blocked so callers can report it for
    /// observability. Returns [`PushResult::Closed`] (dropping the item) if
    /// the queue was closed before a slot freed.
    pub fn push(&self, item: T) -> PushResult {
        let mut inner = self.inner.lock();
        let mut waited = Duration::ZERO;
        loop {
            match inner.state {
                State::Closed => return PushResult::Closed,
                State::Finished => {
                    // Pushing after finish() is an upstream wiring bug; the
                    // step layer asserts on it first, so this is unreachable
                    // in practice. Treat it as shutdown rather than corrupt
                    // the drain.
                    debug_assert!(false, "push after finish()");
                    return PushResult::Closed;
                }
                State::Open => {}
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.not_empty.notify_one();
                return PushResult::Accepted { waited };
            }
            let start = Instant::now();
            self.not_full.wait(&mut inner);
            waited += start.elapsed();
        }
    }

    /// Dequeue an item, blocking while the queue is empty.
    ///
    /// Wakes with [`PopResult::Finished`] once the backlog is drained after
    /// [`finish`](Self::finish), or with [`PopResult::Closed`] immediately
    /// after [`close`](Self::close).
    pub fn pop(&self) -> PopResult<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.state == State::Closed {
                return PopResult::Closed;
            }
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return PopResult::Item(item);
            }
            if inner.state == State::Finished {
                return PopResult::Finished;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Declare that no more items will be pushed.
    ///
    /// Poppers drain the remaining backlog, then observe
    /// [`PopResult::Finished`]. Idempotent; a no-op after
    /// [`close`](Self::close).
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Open {
            inner.state = State::Finished;
        }
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Cancel the queue: discard the backlog and wake every blocked pusher
    /// and popper. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}
