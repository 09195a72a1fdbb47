//! The task contract: one iterable unit of background work.
//!
//! A task makes progress in **iterations**: each [`Task::step`] call runs
//! until the task either finishes, wants another iteration on the same
//! worker, or suspends itself until a future resume time. Suspension returns
//! control to the engine instead of parking a worker.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::TaskStatus;

/// What a single iteration decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Run another iteration immediately, on the same worker.
    Continue,
    /// Release the worker; do not dispatch again before `resume_at`.
    Suspend {
        /// Earliest wall-clock instant the next iteration may run.
        resume_at: DateTime<Utc>,
    },
    /// The task finished successfully.
    Completed,
    /// The task was abandoned by its own logic.
    Cancelled,
}

/// Failure raised by a task iteration.
///
/// Critical errors bypass the retry budget and terminate the task
/// immediately; retryable errors are re-queued with backoff until the
/// engine's `max_retry` is exhausted.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    /// Human-readable failure description recorded in the error history.
    pub message: String,
    /// Whether the failure short-circuits the retry budget.
    pub critical: bool,
}

impl StepError {
    /// A failure worth retrying with backoff.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            critical: false,
        }
    }

    /// A failure that must terminate the task without retry.
    #[must_use]
    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            critical: true,
        }
    }
}

/// Failure serialising or restoring task-owned private state.
#[derive(Debug, thiserror::Error)]
#[error("failed to serialise task state")]
pub struct TaskStateError {
    /// Underlying serialisation failure.
    #[source]
    pub source: Box<dyn Error + Send + Sync>,
}

impl TaskStateError {
    /// Wrap an underlying serialisation failure.
    #[must_use]
    pub fn new(source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }
}

/// Diagnostics handed to every iteration.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Queue-assigned task identifier (negative for transient tasks).
    pub task_id: i64,
    /// Correlation id propagated through logs for this task.
    pub correlation_id: Uuid,
    /// Identity of the caller that submitted the task, when known.
    pub owner: Option<Uuid>,
    /// Retries consumed so far (0 on the first attempt).
    pub attempt: u32,
}

/// Progress of one named channel of work within a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressChannel {
    /// Total units expected, when known.
    pub total: u64,
    /// Units finished so far.
    pub current: u64,
    /// Human-readable identifier for what is being progressed.
    pub identifier: String,
}

/// Compact description of a task for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Coarse phase label (task-defined vocabulary).
    pub phase: String,
    /// Free-form structured properties.
    pub props: serde_json::Value,
}

/// Queue-owned public state persisted alongside every task row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicState {
    /// Retries consumed; never decreases.
    pub retry_count: u32,
    /// Cumulative milliseconds spent inside iterations.
    pub executed_ms: u64,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
    /// Append-only history of error messages.
    pub error_history: Vec<String>,
    /// Epoch seconds before which a suspending task must not run.
    pub resume_time: i64,
}

/// Persisted representation of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    /// Stable identifier assigned on first persistence.
    pub id: i64,
    /// Type tag selecting the factory used for resume.
    pub kind: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Correlation id propagated through logs.
    pub correlation_id: Uuid,
    /// Identity of the submitting caller, when known.
    pub owner_id: Option<Uuid>,
    /// Opaque task-owned state; persisted verbatim, never interpreted.
    pub private_state: Option<String>,
    /// Queue-owned public state envelope.
    pub public_state: PublicState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Contract every runnable obeys.
///
/// Hooks default to no-ops so simple tasks only implement [`Task::kind`] and
/// [`Task::step`].
#[async_trait]
pub trait Task: Send + Sync {
    /// Type tag under which the task is persisted and resumed.
    fn kind(&self) -> &str;

    /// Whether rows should be written for this task type at all.
    fn persistent(&self) -> bool {
        true
    }

    /// Identity of the caller that owns the task, when known.
    fn owner(&self) -> Option<Uuid> {
        None
    }

    /// Serialised private state, persisted verbatim by the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot serialise its state.
    fn private_state(&self) -> Result<Option<String>, TaskStateError> {
        Ok(None)
    }

    /// Run one iteration.
    ///
    /// # Errors
    ///
    /// Returns a [`StepError`]; retryable errors consume the retry budget,
    /// critical errors terminate the task immediately.
    async fn step(&self, cx: &StepContext) -> Result<StepOutcome, StepError>;

    /// Invoked once after the task reaches a terminal status.
    async fn cleanup(&self, cx: &StepContext, final_status: TaskStatus) {
        let _ = (cx, final_status);
    }

    /// The task's row was created or rehydrated; ids and public state are
    /// now available.
    fn on_attached(&self, row: &TaskRow) {
        let _ = row;
    }

    /// An iteration failed with the given message.
    fn on_error(&self, message: &str) {
        let _ = message;
    }

    /// The engine scheduled a retry; `attempt` counts retries consumed.
    fn on_retry(&self, attempt: u32) {
        let _ = attempt;
    }

    /// An iteration returned after spending `elapsed` on the worker.
    fn on_iteration_complete(&self, elapsed: Duration) {
        let _ = elapsed;
    }

    /// The task is about to be parked until `resume_at`.
    fn on_suspend(&self, resume_at: DateTime<Utc>) {
        let _ = resume_at;
    }

    /// The task's lifecycle status changed.
    fn on_status(&self, status: TaskStatus) {
        let _ = status;
    }

    /// Live progress by channel name.
    fn progress(&self) -> BTreeMap<String, ProgressChannel> {
        BTreeMap::new()
    }

    /// Compact description for the admin surface.
    fn summarize(&self) -> Option<TaskSummary> {
        None
    }
}

/// Failure rebuilding a task from its persisted row.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// No factory was registered for the row's kind.
    #[error("no factory registered for task kind")]
    UnknownKind {
        /// Kind tag that had no registration.
        kind: String,
    },
    /// The registered factory failed to rebuild the task.
    #[error("failed to rebuild task from persisted row")]
    Rebuild {
        /// Kind tag of the failing factory.
        kind: String,
        /// Underlying rebuild failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A factory was already registered under the kind.
    #[error("task kind already registered")]
    Duplicate {
        /// Kind tag that was registered twice.
        kind: String,
    },
}

type TaskFactory = dyn Fn(&TaskRow) -> Result<Arc<dyn Task>, FactoryError> + Send + Sync;

/// Explicit registry mapping task kinds to resume factories.
///
/// Built once at bootstrap and handed to the queue; task types that skip
/// registration are lost on restart by design.
#[derive(Default)]
pub struct TaskFactoryRegistry {
    inner: RwLock<HashMap<String, Arc<TaskFactory>>>,
}

impl TaskFactoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::Duplicate`] when the kind is already taken.
    pub fn register<F>(&self, kind: impl Into<String>, factory: F) -> Result<(), FactoryError>
    where
        F: Fn(&TaskRow) -> Result<Arc<dyn Task>, FactoryError> + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut inner = self.write_lock();
        if inner.contains_key(&kind) {
            return Err(FactoryError::Duplicate { kind });
        }
        inner.insert(kind, Arc::new(factory));
        Ok(())
    }

    /// Whether a factory exists for `kind`.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.read_lock().contains_key(kind)
    }

    /// Rebuild a task from its persisted row.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::UnknownKind`] when no factory is registered,
    /// or the factory's own rebuild failure.
    pub fn build(&self, row: &TaskRow) -> Result<Arc<dyn Task>, FactoryError> {
        let factory = self.read_lock().get(&row.kind).cloned();
        factory.map_or_else(
            || {
                Err(FactoryError::UnknownKind {
                    kind: row.kind.clone(),
                })
            },
            |factory| factory(row),
        )
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<TaskFactory>>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("factory registry lock poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<TaskFactory>>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("factory registry lock poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTask;

    #[async_trait]
    impl Task for NoopTask {
        fn kind(&self) -> &str {
            "noop"
        }

        async fn step(&self, _cx: &StepContext) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Completed)
        }
    }

    fn sample_row(kind: &str) -> TaskRow {
        TaskRow {
            id: 7,
            kind: kind.to_string(),
            status: TaskStatus::Suspending,
            correlation_id: Uuid::new_v4(),
            owner_id: None,
            private_state: None,
            public_state: PublicState::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn registry_rejects_duplicate_kinds() {
        let registry = TaskFactoryRegistry::new();
        registry
            .register("noop", |_row| Ok(Arc::new(NoopTask) as Arc<dyn Task>))
            .unwrap();
        let second = registry.register("noop", |_row| Ok(Arc::new(NoopTask) as Arc<dyn Task>));
        assert!(matches!(second, Err(FactoryError::Duplicate { .. })));
        assert!(registry.contains("noop"));
    }

    #[test]
    fn registry_builds_registered_kind() {
        let registry = TaskFactoryRegistry::new();
        registry
            .register("noop", |_row| Ok(Arc::new(NoopTask) as Arc<dyn Task>))
            .unwrap();

        let task = registry.build(&sample_row("noop")).unwrap();
        assert_eq!(task.kind(), "noop");

        let missing = registry.build(&sample_row("other"));
        assert!(matches!(missing, Err(FactoryError::UnknownKind { .. })));
    }

    #[test]
    fn step_error_constructors_set_severity() {
        assert!(!StepError::retryable("net down").critical);
        assert!(StepError::critical("bad config").critical);
    }
}
