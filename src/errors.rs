//! Error types for stage execution.

use thiserror::Error;

use crate::signal::PanicCause;

/// Result type alias for stage operations.
pub type Result<T> = std::result::Result<T, StageError>;

/// Error type for stage construction and execution.
///
/// Protocol violations (out-of-order tickets, `receive` after
/// `end_of_upstream`, double wiring) are *not* represented here: those are
/// fatal programming errors in the pipeline wiring and panic with full
/// context instead of surfacing as recoverable values.
#[derive(Error, Debug)]
pub enum StageError {
    /// A step panicked and the stage was torn down. Carries the first cause
    /// the stage observed; later causes are suppressed for control purposes
    /// but counted for diagnostics.
    #[error("stage '{stage}': step '{step}' panicked: {cause}")]
    Panicked {
        /// The stage name.
        stage: String,
        /// The step where the first observed panic originated.
        step: String,
        /// The first recorded failure cause.
        cause: PanicCause,
    },

    /// The stage was assembled with an invalid configuration.
    #[error("stage '{stage}': invalid configuration: {reason}")]
    InvalidConfig {
        /// The stage name.
        stage: String,
        /// Explanation of the problem.
        reason: String,
    },
}

impl StageError {
    /// The failure cause carried by a [`StageError::Panicked`], if any.
    #[must_use]
    pub fn cause(&self) -> Option<&PanicCause> {
        match self {
            StageError::Panicked { cause, .. } => Some(cause),
            StageError::InvalidConfig { .. } => None,
        }
    }
}
