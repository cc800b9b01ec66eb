#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation, clippy::module_name_repetitions)]

//! # bulkstage - Staged batch-pipeline execution core
//!
//! This library provides the execution core of a staged batch-processing
//! pipeline: an ordered sequence of steps, each of which consumes batches of
//! work from its upstream neighbor, transforms them using one or more parallel
//! workers, and forwards them downstream in a strict, gap-free ticket order.
//!
//! ## Overview
//!
//! The crate is organized into a handful of small modules:
//!
//! - **[`stage`]** - The [`Stage`] orchestrator: wires steps together, starts
//!   them, drives the head producer, and supervises the run to a single
//!   terminal outcome (success or first failure).
//! - **[`step`]** - The [`Step`] contract plus the two concrete step kinds:
//!   [`ProducerStep`] (assigns tickets) and [`ProcessorStep`] (bounded queue,
//!   worker pool, reorder buffer).
//! - **[`queue`]** - [`BoundedQueue`], the fixed-capacity blocking queue that
//!   implements per-step backpressure and cancellation-aware waits.
//! - **[`reorder_buffer`]** - [`ReorderBuffer`], which lets workers finish
//!   batches in any order while releasing them strictly in ticket order.
//! - **[`signal`]** - [`PanicSignal`], the stage-wide shutdown broadcast, and
//!   [`PanicCause`], the cloneable failure value it carries.
//! - **[`stats`]** - [`StepStats`] snapshots and the atomic [`StepMonitor`]
//!   that backs them.
//! - **[`errors`]** - [`StageError`] and the crate [`Result`] alias.
//!
//! ## Example
//!
//! ```
//! use bulkstage::{Stage, StepConfig};
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink_seen = Arc::clone(&seen);
//!
//! let stage = Stage::builder("example")
//!     .producer_iter("read", 0u64..100)
//!     .step("double", StepConfig::new().with_parallelism(4), |n| Ok(n * 2))
//!     .sink("collect", StepConfig::new(), move |n| {
//!         sink_seen.lock().push(n);
//!         Ok(())
//!     })
//!     .build()
//!     .expect("valid stage");
//!
//! stage.run().expect("stage completes");
//! assert_eq!(*seen.lock(), (0u64..100).map(|n| n * 2).collect::<Vec<_>>());
//! ```
//!
//! ## Guarantees
//!
//! - Every step observes tickets `0, 1, 2, ...` with no gaps and no repeats,
//!   identical to the order the producer emitted, regardless of per-step
//!   parallelism.
//! - A step never holds more unprocessed batches than its configured queue
//!   capacity; upstream blocks (and reports the blocked time) once the queue
//!   is full.
//! - Any failure anywhere - a transformation error, a worker panic, or an
//!   external [`Step::receive_panic`] call - unwinds the whole stage promptly,
//!   waking threads parked on full or empty queues.

pub mod errors;
pub mod queue;
pub mod reorder_buffer;
pub mod signal;
pub mod stage;
pub mod stats;
pub mod step;

pub use errors::{Result, StageError};
pub use queue::{BoundedQueue, PopResult, PushResult};
pub use reorder_buffer::ReorderBuffer;
pub use signal::{PanicCause, PanicSignal};
pub use stage::{Stage, StageBuilder};
pub use stats::{StepMonitor, StepStats};
pub use step::{ProcessorStep, ProducerStep, Step, StepConfig, DEFAULT_QUEUE_CAPACITY};
