//! Structured error taxonomy for OctopusDB.
//!
//! `OctopusError` is the only error type that crosses a public API boundary.
//! Internals that need an escape hatch for arbitrary failure causes (the
//! closure passed to [`crate::occ::OccHandler::perform`], a worker panic)
//! carry an `anyhow::Error` wrapped in [`OctopusError::OperationFailed`]
//! rather than leaking `anyhow::Error` itself out of the crate.

use thiserror::Error;

/// Errors produced by OctopusDB's execution substrate and command layer.
#[derive(Debug, Error)]
pub enum OctopusError {
    /// An operation was applied to a value of an incompatible type.
    #[error("WRONGTYPE: operation against a key holding the wrong kind of value")]
    WrongType,

    /// `incr`/`decr` was applied to a value that is not an integer.
    #[error("value is not an integer")]
    NotInteger,

    /// OCC metadata is missing for the given worker id.
    #[error("no metadata found for worker {0}")]
    NotFound(u32),

    /// OCC version mismatch: another writer moved the record forward first.
    #[error("version conflict on worker {0}: expected {1}")]
    Conflict(u32, u64),

    /// The closure passed to [`crate::occ::OccHandler::perform`] failed.
    #[error("operation failed: {0}")]
    OperationFailed(#[source] anyhow::Error),

    /// An execution context terminated abnormally while a task was in flight.
    #[error("worker crashed (exit code {0:?})")]
    WorkerCrashed(Option<i32>),

    /// The caller's task was dropped from the queue before being claimed
    /// (e.g. superseded by a duplicate that already completed).
    #[error("operation was cancelled before dispatch")]
    Cancelled,

    /// The pool is tearing down and refuses new work.
    #[error("pool is shutting down")]
    ShuttingDown,

    /// A transaction operation was attempted after `commit`/`rollback`.
    #[error("transaction already committed")]
    AlreadyCommitted,

    /// `unlock()` was called by a task that does not hold the mutex.
    #[error("unlock() called by a task that is not the current owner")]
    NotOwner,

    /// The routed worker's task queue is already at its configured capacity.
    #[error("task queue is at capacity ({0})")]
    QueueFull(usize),
}

impl OctopusError {
    /// True for errors that represent a worker-local command failure
    /// (type mismatches, non-integer values) rather than a substrate fault.
    ///
    /// These are reported as the command's result and never degrade the
    /// owning execution context or trigger worker replacement.
    pub fn is_worker_local(&self) -> bool {
        matches!(self, OctopusError::WrongType | OctopusError::NotInteger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_type_and_not_integer_are_worker_local() {
        assert!(OctopusError::WrongType.is_worker_local());
        assert!(OctopusError::NotInteger.is_worker_local());
        assert!(!OctopusError::Conflict(1, 2).is_worker_local());
        assert!(!OctopusError::ShuttingDown.is_worker_local());
    }

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            OctopusError::NotOwner.to_string(),
            "unlock() called by a task that is not the current owner"
        );
        assert!(OctopusError::Conflict(3, 7).to_string().contains("worker 3"));
        assert!(OctopusError::NotFound(9).to_string().contains("worker 9"));
    }
}
