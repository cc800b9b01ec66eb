//! The stage orchestrator: assembles a chain of steps, runs it, and
//! reduces the run to a single terminal outcome.
//!
//! A [`Stage`] is built with [`StageBuilder`]: one producer at the head,
//! then any number of processing steps, ending (by convention) in a sink.
//! [`Stage::run`] starts every step's threads, then supervises lifecycle
//! events from the steps over a channel: all steps completing means
//! success, while the first failure is broadcast to every step and
//! returned as the run's error once all threads have wound down.

use crossbeam_channel::{unbounded, Receiver};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{Result, StageError};
use crate::signal::{PanicSignal, StepEvent};
use crate::step::{BatchSource, ProcessorStep, ProducerStep, Step, StepConfig, Transform};

/// A fully wired chain of steps, ready to run once.
pub struct Stage<B: Send + 'static> {
    name: String,
    steps: Vec<Arc<dyn Step<B>>>,
    signal: Arc<PanicSignal>,
    events: Receiver<StepEvent>,
    started: AtomicBool,
}

impl<B: Send + 'static> Stage<B> {
    /// Start building a stage with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> StageBuilder<B> {
        StageBuilder { name: name.into(), pending: Vec::new() }
    }

    /// The stage's name, used in logs and error reports.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The steps in upstream-to-downstream order. Useful for polling
    /// [`Step::stats`] during a run or injecting an external
    /// [`Step::receive_panic`] to abort one.
    #[must_use]
    pub fn steps(&self) -> &[Arc<dyn Step<B>>] {
        &self.steps
    }

    /// Run the stage to completion or first failure.
    ///
    /// Blocks until every thread the stage spawned has exited, so on
    /// return no work is still in flight, successful or not. The error
    /// carries the root cause; failures triggered by the shutdown itself
    /// are suppressed (and logged in aggregate).
    ///
    /// # Panics
    ///
    /// Panics if called more than once: steps cannot be restarted.
    pub fn run(&self) -> Result<()> {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "stage '{}' can only be run once",
            self.name
        );
        info!("stage '{}' starting ({} steps)", self.name, self.steps.len());
        // Downstream first, so a batch can never reach an unstarted step.
        for step in self.steps.iter().rev() {
            Arc::clone(step).start();
        }
        self.supervise()
    }

    fn supervise(&self) -> Result<()> {
        let mut completed = 0usize;
        loop {
            // Steps hold the sender ends for as long as the stage holds the
            // steps, so recv only fails if supervision outlives them.
            let Ok(event) = self.events.recv() else {
                unreachable!("stage '{}': event channel closed mid-run", self.name);
            };
            match event {
                StepEvent::Completed { step } => {
                    debug!("stage '{}': step '{step}' completed", self.name);
                    completed += 1;
                    if completed == self.steps.len() {
                        for step in &self.steps {
                            step.join();
                        }
                        info!("stage '{}' completed", self.name);
                        return Ok(());
                    }
                }
                StepEvent::Panicked { step, cause } => {
                    warn!("stage '{}': step '{step}' failed: {cause}", self.name);
                    // Broadcast so every step, upstream of the failure
                    // included, discards its backlog and winds down.
                    for s in &self.steps {
                        s.receive_panic(cause.clone());
                    }
                    for s in &self.steps {
                        s.join();
                    }
                    let suppressed = self.signal.suppressed();
                    if suppressed > 0 {
                        warn!(
                            "stage '{}': suppressed {suppressed} secondary failure(s) behind the first cause",
                            self.name
                        );
                    }
                    let cause = self.signal.cause().unwrap_or(cause);
                    return Err(StageError::Panicked { stage: self.name.clone(), step, cause });
                }
            }
        }
    }
}

enum PendingStep<B> {
    Producer { name: String, source: BatchSource<B> },
    Processor { name: String, config: StepConfig, transform: Transform<B> },
}

impl<B> PendingStep<B> {
    fn name(&self) -> &str {
        match self {
            PendingStep::Producer { name, .. } | PendingStep::Processor { name, .. } => name,
        }
    }
}

/// Builder for a [`Stage`]: a producer at the head followed by one or more
/// processing steps, validated and wired by [`build`](Self::build).
pub struct StageBuilder<B> {
    name: String,
    pending: Vec<PendingStep<B>>,
}

impl<B: Send + 'static> StageBuilder<B> {
    /// Add the head producer. `source` is polled on a dedicated thread;
    /// `Ok(None)` ends the input, `Err` fails the stage.
    #[must_use]
    pub fn producer(
        mut self,
        name: impl Into<String>,
        source: impl FnMut() -> anyhow::Result<Option<B>> + Send + 'static,
    ) -> Self {
        self.pending.push(PendingStep::Producer { name: name.into(), source: Box::new(source) });
        self
    }

    /// Add a head producer that drains an iterator.
    #[must_use]
    pub fn producer_iter<I>(self, name: impl Into<String>, batches: I) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: Send + 'static,
    {
        let mut batches = batches.into_iter();
        self.producer(name, move || Ok(batches.next()))
    }

    /// Add a processing step whose transform maps each batch to a new one.
    #[must_use]
    pub fn step(
        mut self,
        name: impl Into<String>,
        config: StepConfig,
        transform: impl Fn(B) -> anyhow::Result<B> + Send + Sync + 'static,
    ) -> Self {
        self.pending.push(PendingStep::Processor {
            name: name.into(),
            config,
            transform: Box::new(move |batch| transform(batch).map(Some)),
        });
        self
    }

    /// Add a terminal step that consumes batches without forwarding.
    #[must_use]
    pub fn sink(
        mut self,
        name: impl Into<String>,
        config: StepConfig,
        consume: impl Fn(B) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.pending.push(PendingStep::Processor {
            name: name.into(),
            config,
            transform: Box::new(move |batch| {
                consume(batch)?;
                Ok(None)
            }),
        });
        self
    }

    /// Validate the chain and wire it into a runnable [`Stage`].
    pub fn build(self) -> Result<Stage<B>> {
        let invalid = |reason: String| StageError::InvalidConfig { stage: self.name.clone(), reason };

        if self.pending.len() < 2 {
            return Err(invalid("a stage needs a producer and at least one processing step".into()));
        }
        if !matches!(self.pending[0], PendingStep::Producer { .. }) {
            return Err(invalid("the first step must be a producer".into()));
        }
        for pending in &self.pending[1..] {
            match pending {
                PendingStep::Producer { name, .. } => {
                    return Err(invalid(format!(
                        "only the first step may be a producer (found producer '{name}' mid-chain)"
                    )));
                }
                PendingStep::Processor { name, config, .. } => {
                    if config.parallelism < 1 {
                        return Err(invalid(format!("step '{name}': parallelism must be at least 1")));
                    }
                    if config.queue_capacity < 1 {
                        return Err(invalid(format!(
                            "step '{name}': queue capacity must be at least 1"
                        )));
                    }
                }
            }
        }
        for (i, pending) in self.pending.iter().enumerate() {
            if self.pending[..i].iter().any(|other| other.name() == pending.name()) {
                return Err(invalid(format!("duplicate step name '{}'", pending.name())));
            }
        }

        let signal = Arc::new(PanicSignal::new());
        let (events_tx, events_rx) = unbounded();
        let steps: Vec<Arc<dyn Step<B>>> = self
            .pending
            .into_iter()
            .map(|pending| match pending {
                PendingStep::Producer { name, source } => Arc::new(ProducerStep::new(
                    name,
                    source,
                    Arc::clone(&signal),
                    events_tx.clone(),
                )) as Arc<dyn Step<B>>,
                PendingStep::Processor { name, config, transform } => Arc::new(ProcessorStep::new(
                    name,
                    config,
                    transform,
                    Arc::clone(&signal),
                    events_tx.clone(),
                )) as Arc<dyn Step<B>>,
            })
            .collect();
        for pair in steps.windows(2) {
            pair[0].set_downstream(Arc::clone(&pair[1]));
        }

        Ok(Stage { name: self.name, steps, signal, events: events_rx, started: AtomicBool::new(false) })
    }
}
