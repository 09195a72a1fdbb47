//! Error types surfaced by the queue engine.

use crate::repo::RepositoryError;
use crate::status::TaskStatus;
use crate::task::TaskStateError;

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the queue engine to callers.
///
/// Only [`QueueError::Shutdown`] and [`QueueError::SchedulerFull`] escape
/// from `submit`; everything else is reported at start-up or logged and
/// absorbed by the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue no longer accepts submissions.
    #[error("queue has been shut down")]
    Shutdown,
    /// The scheduler is at capacity; callers may apply backpressure.
    #[error("scheduler is at capacity")]
    SchedulerFull,
    /// `start` was called twice.
    #[error("queue already started")]
    AlreadyStarted,
    /// An edge outside the lifecycle table was attempted.
    #[error("illegal task status transition")]
    IllegalTransition {
        /// Status the task held before the attempt.
        from: Option<TaskStatus>,
        /// Status the attempt tried to reach.
        to: TaskStatus,
    },
    /// Task persistence failed.
    #[error("task persistence failed")]
    Repository {
        /// Underlying repository failure.
        #[source]
        source: RepositoryError,
    },
    /// The task could not serialise its private state.
    #[error("failed to serialise task state")]
    State {
        /// Underlying serialisation failure.
        #[source]
        source: TaskStateError,
    },
}
