//! Stage-wide failure signalling.
//!
//! When any step fails, the whole stage must stop: upstream steps stop
//! producing, queued batches are discarded, and blocked threads wake. The
//! [`PanicSignal`] is the shared flag every step polls, and it records the
//! first cause so the stage can report the root failure rather than one of
//! the cascading shutdowns it triggers.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A cheaply cloneable failure cause carried across step boundaries.
///
/// Wraps the underlying error in an `Arc` so the same cause can be
/// broadcast to every step and compared by identity when deciding whether
/// a later report is a re-broadcast or a genuinely distinct failure.
#[derive(Clone)]
pub struct PanicCause {
    inner: Arc<anyhow::Error>,
}

impl PanicCause {
    /// Wrap an error as a shareable cause.
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self { inner: Arc::new(error) }
    }

    /// The underlying error.
    #[must_use]
    pub fn error(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Whether `other` is a clone of this same cause (identity, not
    /// message equality).
    #[must_use]
    pub fn same_as(&self, other: &PanicCause) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl From<anyhow::Error> for PanicCause {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for PanicCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Alternate form prints the full context chain.
        write!(f, "{:#}", self.inner)
    }
}

impl fmt::Debug for PanicCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// First-cause-wins failure flag shared by every step in a stage.
///
/// [`raise`](Self::raise) records the first cause and ignores later ones;
/// steps poll [`is_panicked`](Self::is_panicked) (a single relaxed atomic
/// load) on their hot paths. Distinct causes raised after the first are
/// counted as suppressed so shutdown can report how many secondary
/// failures were folded into the root cause.
pub struct PanicSignal {
    panicked: AtomicBool,
    cause: Mutex<Option<PanicCause>>,
    suppressed: AtomicU64,
}

impl PanicSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            cause: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Record a failure cause. Returns true if this was the first cause;
    /// later distinct causes are counted as suppressed, while re-raises of
    /// the same cause (broadcast echoes) are ignored.
    pub fn raise(&self, cause: &PanicCause) -> bool {
        let mut slot = self.cause.lock();
        match &*slot {
            None => {
                *slot = Some(cause.clone());
                self.panicked.store(true, Ordering::Release);
                true
            }
            Some(first) => {
                if !first.same_as(cause) {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        }
    }

    /// Whether any step has failed. Cheap enough for per-batch polling.
    #[must_use]
    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// The first recorded cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<PanicCause> {
        self.cause.lock().clone()
    }

    /// Number of distinct later causes folded into the first.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl Default for PanicSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle notifications steps send their supervising stage.
pub(crate) enum StepEvent {
    /// The step finished all its work and notified downstream.
    Completed { step: String },
    /// The step observed a failure (its own or a worker's).
    Panicked { step: String, cause: PanicCause },
}
