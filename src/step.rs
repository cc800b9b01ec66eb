//! Steps: the executable units a stage is assembled from.
//!
//! # Architecture
//!
//! A stage is a linear chain of steps. The head is a [`ProducerStep`] that
//! pulls batches from a source callback and assigns each a ticket (0, 1,
//! 2, ...). Every later step is a [`ProcessorStep`]: a bounded ingress
//! queue feeding a pool of worker threads that run the step's transform,
//! with a reorder buffer on the way out so downstream always observes
//! tickets in issue order even when workers finish out of order.
//!
//! Steps hand batches to each other through the [`Step`] trait, so the
//! chain is wired with `Arc<dyn Step<B>>` and a step never knows what is
//! concretely upstream or downstream of it. `receive` returns the
//! milliseconds the caller was blocked on a full queue, which callers fold
//! into their own blocked-time counter; comparing those counters across a
//! stage points at the bottleneck step.
//!
//! Failure flows through [`Step::receive_panic`]: the first cause wins in
//! the shared [`PanicSignal`], the ingress queue is closed (discarding the
//! backlog), and the cause is relayed downstream so every step drains its
//! workers promptly instead of finishing queued work nobody wants.

use crossbeam_channel::Sender;
use log::warn;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::queue::{BoundedQueue, PopResult, PushResult};
use crate::reorder_buffer::ReorderBuffer;
use crate::signal::{PanicCause, PanicSignal, StepEvent};
use crate::stats::{StepMonitor, StepStats};

/// Default ingress queue capacity for a processing step.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Tunables for a single processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepConfig {
    /// Number of worker threads running the transform.
    pub parallelism: usize,
    /// Ingress queue capacity; bounds how far upstream can run ahead.
    pub queue_capacity: usize,
}

impl StepConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self { parallelism: 1, queue_capacity: DEFAULT_QUEUE_CAPACITY }
    }
}

/// A processing step's transform. Returning `Ok(None)` consumes the batch
/// without forwarding anything (sinks and filters); `Err` fails the stage.
pub type Transform<B> = Box<dyn Fn(B) -> anyhow::Result<Option<B>> + Send + Sync>;

/// A producer's batch source. Returning `Ok(None)` signals end of input;
/// `Err` fails the stage.
pub type BatchSource<B> = Box<dyn FnMut() -> anyhow::Result<Option<B>> + Send>;

/// One link in a stage's chain of processing steps.
///
/// Batches travel downstream through [`receive`](Step::receive) under
/// strictly increasing, gap-free tickets. End of input travels the same
/// direction through [`end_of_upstream`](Step::end_of_upstream), and
/// failure through [`receive_panic`](Step::receive_panic).
pub trait Step<B>: Send + Sync {
    /// Human-readable step name, used in logs and error reports.
    fn name(&self) -> &str;

    /// Hand this step the batch for `ticket`.
    ///
    /// Blocks while the step's ingress queue is full and returns the
    /// milliseconds spent blocked, for the caller's own bookkeeping.
    /// After a failure anywhere in the stage the batch is discarded and 0
    /// is returned.
    ///
    /// # Panics
    ///
    /// Panics if `ticket` is not the next expected ticket, or if called
    /// after [`end_of_upstream`](Step::end_of_upstream). Both are protocol
    /// violations by the caller, not runtime conditions.
    fn receive(&self, ticket: u64, batch: B) -> u64;

    /// Snapshot of this step's counters.
    fn stats(&self) -> StepStats;

    /// Upstream will send no more batches. Idempotent.
    fn end_of_upstream(&self);

    /// True once this step has processed every batch it will ever get and
    /// has relayed end of input downstream. Never true after a failure.
    fn is_completed(&self) -> bool;

    /// Wire the step this one forwards to.
    ///
    /// # Panics
    ///
    /// Panics if a downstream is already wired.
    fn set_downstream(&self, downstream: Arc<dyn Step<B>>);

    /// Notify this step of a failure. The first cause wins; the cause is
    /// relayed downstream, queued batches are discarded, and the step's
    /// workers wind down without completing.
    fn receive_panic(&self, cause: PanicCause);

    /// Spawn this step's threads.
    fn start(self: Arc<Self>);

    /// Block until every thread this step spawned has exited.
    fn join(&self);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}

/// Route a panic that escaped a step thread into the normal failure path.
/// A thread that died without reporting would leave the supervising stage
/// waiting on an event that never comes.
fn fail_from_unwind<B>(step: &dyn Step<B>, payload: Box<dyn Any + Send>) {
    step.receive_panic(PanicCause::new(anyhow!(
        "step '{}' thread aborted: {}",
        step.name(),
        panic_message(payload.as_ref())
    )));
}

/// A mid-chain or terminal step: bounded ingress queue, a pool of
/// `parallelism` workers running the transform, and a reorder buffer that
/// restores ticket order on the way out.
pub struct ProcessorStep<B> {
    name: String,
    config: StepConfig,
    queue: BoundedQueue<(u64, B)>,
    /// Finished results waiting for their turn. `None` marks a batch the
    /// transform consumed (sink or filter); it still occupies its ticket so
    /// the ordering stays gap-free.
    reorder: Mutex<ReorderBuffer<Option<B>>>,
    /// Next ticket to issue downstream. Doubles as the forwarding lock:
    /// only the holder may call downstream, so the downstream sequence is
    /// gap-free even when a filtering transform consumes batches.
    next_out_ticket: Mutex<u64>,
    downstream: OnceLock<Arc<dyn Step<B>>>,
    signal: Arc<PanicSignal>,
    events: Sender<StepEvent>,
    transform: Transform<B>,
    monitor: StepMonitor,
    end_received: AtomicBool,
    completed: AtomicBool,
    panicked: AtomicBool,
    /// Next ticket `receive` will accept.
    expected_ticket: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Send + 'static> ProcessorStep<B> {
    pub(crate) fn new(
        name: impl Into<String>,
        config: StepConfig,
        transform: Transform<B>,
        signal: Arc<PanicSignal>,
        events: Sender<StepEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            queue: BoundedQueue::new(config.queue_capacity),
            reorder: Mutex::new(ReorderBuffer::new()),
            next_out_ticket: Mutex::new(0),
            downstream: OnceLock::new(),
            signal,
            events,
            transform,
            monitor: StepMonitor::new(config.parallelism),
            end_received: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            expected_ticket: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn run_worker(self: &Arc<Self>) {
        loop {
            let idle_start = Instant::now();
            match self.queue.pop() {
                PopResult::Item((ticket, batch)) => {
                    self.monitor.add_blocked(idle_start.elapsed());
                    let work_start = Instant::now();
                    let result = panic::catch_unwind(AssertUnwindSafe(|| (self.transform)(batch)));
                    self.monitor.add_processing(work_start.elapsed());
                    match result {
                        Ok(Ok(output)) => {
                            self.reorder.lock().insert(ticket, output);
                            self.forward_ready();
                        }
                        Ok(Err(error)) => {
                            let cause = PanicCause::new(
                                error.context(format!("step '{}' failed on ticket {ticket}", self.name)),
                            );
                            self.receive_panic(cause);
                            return;
                        }
                        Err(payload) => {
                            let cause = PanicCause::new(anyhow!(
                                "step '{}' worker panicked on ticket {ticket}: {}",
                                self.name,
                                panic_message(payload.as_ref())
                            ));
                            self.receive_panic(cause);
                            return;
                        }
                    }
                }
                PopResult::Finished | PopResult::Closed => return,
            }
        }
    }

    /// Forward the contiguous run of in-order results downstream.
    ///
    /// Only one worker forwards at a time so downstream's ticket check
    /// holds; a worker that loses the race re-checks after the holder
    /// releases, closing the window where a result lands between the
    /// holder's last pop and its unlock.
    fn forward_ready(self: &Arc<Self>) {
        loop {
            let Some(mut next_out) = self.next_out_ticket.try_lock() else {
                return;
            };
            loop {
                if self.signal.is_panicked() {
                    return;
                }
                let released = self.reorder.lock().try_pop_next();
                match released {
                    Some((ticket, Some(batch))) => {
                        let Some(downstream) = self.downstream.get() else {
                            panic!(
                                "step '{}' produced output for ticket {ticket} but has no downstream",
                                self.name
                            );
                        };
                        let waited = downstream.receive(*next_out, batch);
                        *next_out += 1;
                        self.monitor.add_blocked(Duration::from_millis(waited));
                        self.monitor.inc_done();
                    }
                    Some((_, None)) => self.monitor.inc_done(),
                    None => break,
                }
            }
            drop(next_out);
            if !self.reorder.lock().can_pop() {
                return;
            }
        }
    }

    /// Runs on the last worker to exit. If the drain was clean, flush the
    /// reorder buffer, mark completion, and relay end of input downstream.
    fn on_last_worker_exit(self: &Arc<Self>) {
        if self.panicked.load(Ordering::Acquire) || self.signal.is_panicked() {
            return;
        }
        self.forward_ready();
        // A failure can land while forward_ready is draining, in which case
        // it abandons the buffered results. That is shutdown, not a
        // stranded-result bug.
        if self.signal.is_panicked() {
            return;
        }
        debug_assert!(
            self.reorder.lock().is_empty(),
            "step '{}' completed with results stranded in the reorder buffer",
            self.name
        );
        self.completed.store(true, Ordering::Release);
        if let Some(downstream) = self.downstream.get() {
            downstream.end_of_upstream();
        }
        let _ = self.events.send(StepEvent::Completed { step: self.name.clone() });
    }
}

impl<B: Send + 'static> Step<B> for ProcessorStep<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self, ticket: u64, batch: B) -> u64 {
        if self.panicked.load(Ordering::Acquire) || self.signal.is_panicked() {
            return 0;
        }
        assert!(
            !self.end_received.load(Ordering::Acquire),
            "step '{}': receive({ticket}) after end_of_upstream",
            self.name
        );
        let expected = self.expected_ticket.fetch_add(1, Ordering::AcqRel);
        assert_eq!(
            ticket, expected,
            "step '{}': ticket {ticket} out of order (expected {expected})",
            self.name
        );
        match self.queue.push((ticket, batch)) {
            PushResult::Accepted { waited } => waited.as_millis() as u64,
            PushResult::Closed => 0,
        }
    }

    fn stats(&self) -> StepStats {
        self.monitor.snapshot(self.queue.len())
    }

    fn end_of_upstream(&self) {
        if self.end_received.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.finish();
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn set_downstream(&self, downstream: Arc<dyn Step<B>>) {
        if self.downstream.set(downstream).is_err() {
            panic!("step '{}': downstream already wired", self.name);
        }
    }

    fn receive_panic(&self, cause: PanicCause) {
        if self.panicked.swap(true, Ordering::AcqRel) {
            self.signal.raise(&cause);
            return;
        }
        let first = self.signal.raise(&cause);
        self.queue.close();
        if first {
            warn!("step '{}' failing stage: {cause}", self.name);
            let _ = self.events.send(StepEvent::Panicked { step: self.name.clone(), cause: cause.clone() });
        }
        if let Some(downstream) = self.downstream.get() {
            downstream.receive_panic(cause);
        }
    }

    fn start(self: Arc<Self>) {
        let mut handles = self.handles.lock();
        assert!(handles.is_empty(), "step '{}' already started", self.name);
        // Register every worker before any runs: otherwise a fast worker
        // could hit an empty, finished queue and see itself as the last
        // one out while its siblings are still being spawned.
        for _ in 0..self.config.parallelism {
            self.monitor.worker_started();
        }
        for i in 0..self.config.parallelism {
            let step = Arc::clone(&self);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{i}", self.name))
                .spawn(move || {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| step.run_worker())) {
                        fail_from_unwind(&*step, payload);
                    }
                    if step.monitor.worker_stopped() == 1 {
                        if let Err(payload) =
                            panic::catch_unwind(AssertUnwindSafe(|| step.on_last_worker_exit()))
                        {
                            fail_from_unwind(&*step, payload);
                        }
                    }
                })
                .unwrap_or_else(|error| {
                    panic!("step '{}': failed to spawn worker thread: {error}", self.name)
                });
            handles.push(handle);
        }
    }

    fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("step '{}': worker thread panicked during shutdown", self.name);
            }
        }
    }
}

/// The head of a chain: pulls batches from a source callback on a single
/// thread and issues tickets 0, 1, 2, ... as it hands them downstream.
pub struct ProducerStep<B> {
    name: String,
    /// Taken by the producer thread on start.
    source: Mutex<Option<BatchSource<B>>>,
    downstream: OnceLock<Arc<dyn Step<B>>>,
    signal: Arc<PanicSignal>,
    events: Sender<StepEvent>,
    monitor: StepMonitor,
    completed: AtomicBool,
    panicked: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Send + 'static> ProducerStep<B> {
    pub(crate) fn new(
        name: impl Into<String>,
        source: BatchSource<B>,
        signal: Arc<PanicSignal>,
        events: Sender<StepEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            source: Mutex::new(Some(source)),
            downstream: OnceLock::new(),
            signal,
            events,
            monitor: StepMonitor::new(1),
            completed: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    fn run_producer(self: &Arc<Self>) {
        let Some(mut source) = self.source.lock().take() else {
            return;
        };
        let Some(downstream) = self.downstream.get().cloned() else {
            panic!("producer step '{}' has no downstream wired", self.name);
        };
        let mut ticket = 0u64;
        loop {
            if self.panicked.load(Ordering::Acquire) || self.signal.is_panicked() {
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| source())) {
                Ok(Ok(Some(batch))) => {
                    let waited = downstream.receive(ticket, batch);
                    self.monitor.add_blocked(Duration::from_millis(waited));
                    self.monitor.inc_done();
                    ticket += 1;
                }
                Ok(Ok(None)) => {
                    self.completed.store(true, Ordering::Release);
                    downstream.end_of_upstream();
                    let _ = self.events.send(StepEvent::Completed { step: self.name.clone() });
                    return;
                }
                Ok(Err(error)) => {
                    let cause = PanicCause::new(
                        error.context(format!("producer step '{}' failed at ticket {ticket}", self.name)),
                    );
                    self.receive_panic(cause);
                    return;
                }
                Err(payload) => {
                    let cause = PanicCause::new(anyhow!(
                        "producer step '{}' panicked at ticket {ticket}: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    ));
                    self.receive_panic(cause);
                    return;
                }
            }
        }
    }
}

impl<B: Send + 'static> Step<B> for ProducerStep<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self, ticket: u64, _batch: B) -> u64 {
        panic!("producer step '{}' cannot receive batches (got ticket {ticket})", self.name);
    }

    fn stats(&self) -> StepStats {
        self.monitor.snapshot(0)
    }

    fn end_of_upstream(&self) {
        panic!("producer step '{}' has no upstream", self.name);
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn set_downstream(&self, downstream: Arc<dyn Step<B>>) {
        if self.downstream.set(downstream).is_err() {
            panic!("step '{}': downstream already wired", self.name);
        }
    }

    fn receive_panic(&self, cause: PanicCause) {
        if self.panicked.swap(true, Ordering::AcqRel) {
            self.signal.raise(&cause);
            return;
        }
        let first = self.signal.raise(&cause);
        if first {
            warn!("step '{}' failing stage: {cause}", self.name);
            let _ = self.events.send(StepEvent::Panicked { step: self.name.clone(), cause: cause.clone() });
        }
        if let Some(downstream) = self.downstream.get() {
            downstream.receive_panic(cause);
        }
    }

    fn start(self: Arc<Self>) {
        let mut handle = self.handle.lock();
        assert!(handle.is_none(), "step '{}' already started", self.name);
        let step = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name(format!("{}-producer", self.name))
            .spawn(move || {
                step.monitor.worker_started();
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| step.run_producer())) {
                    fail_from_unwind(&*step, payload);
                }
                step.monitor.worker_stopped();
            })
            .unwrap_or_else(|error| {
                panic!("step '{}': failed to spawn producer thread: {error}", self.name)
            });
        *handle = Some(spawned);
    }

    fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("step '{}': producer thread panicked during shutdown", self.name);
            }
        }
    }
}
