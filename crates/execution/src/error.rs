//! Engine error type.

use crate::aggregator::DuplicateResultError;

/// Errors the engine returns to its caller.
///
/// Step failures never appear here; they are recorded in the
/// [`collective_core::ExecutionResult`]. These are internal invariant
/// violations only.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A step's result was recorded twice
    #[error(transparent)]
    DuplicateResult(#[from] DuplicateResultError),

    /// A step task panicked
    #[error("step task failed: {0}")]
    StepTask(String),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
