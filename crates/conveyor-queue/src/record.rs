//! Live handle pairing a task implementation with its queue-owned state.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use crate::status::TaskStatus;
use crate::task::{PublicState, Task, TaskRow, TaskStateError};

/// A task admitted to the queue, together with the state the queue owns for
/// it: identity, status, retry accounting, and resume time.
///
/// The engine guarantees at most one worker touches a record at a time, but
/// the registry exposes records for mid-flight inspection, so all state sits
/// behind a mutex.
pub struct TaskRecord {
    task: Arc<dyn Task>,
    state: Mutex<RecordState>,
}

struct RecordState {
    id: i64,
    status: Option<TaskStatus>,
    correlation_id: Uuid,
    persisted: bool,
    retry_count: u32,
    executed: Duration,
    last_error: Option<String>,
    error_history: Vec<String>,
    resume_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub(crate) fn new(task: Arc<dyn Task>, correlation_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            task,
            state: Mutex::new(RecordState {
                id: 0,
                status: None,
                correlation_id,
                persisted: false,
                retry_count: 0,
                executed: Duration::ZERO,
                last_error: None,
                error_history: Vec::new(),
                resume_at: now,
                created_at: now,
            }),
        }
    }

    pub(crate) fn from_row(task: Arc<dyn Task>, row: &TaskRow) -> Self {
        let resume_at = DateTime::<Utc>::from_timestamp(row.public_state.resume_time, 0)
            .unwrap_or_else(Utc::now);
        Self {
            task,
            state: Mutex::new(RecordState {
                id: row.id,
                status: Some(row.status),
                correlation_id: row.correlation_id,
                persisted: true,
                retry_count: row.public_state.retry_count,
                executed: Duration::from_millis(row.public_state.executed_ms),
                last_error: row.public_state.last_error.clone(),
                error_history: row.public_state.error_history.clone(),
                resume_at,
                created_at: row.created_at,
            }),
        }
    }

    /// The task implementation behind this record.
    #[must_use]
    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// Queue-assigned identifier (negative for transient tasks, 0 before
    /// assignment).
    #[must_use]
    pub fn id(&self) -> i64 {
        self.lock_state().id
    }

    /// Current lifecycle status, `None` before admission.
    #[must_use]
    pub fn status(&self) -> Option<TaskStatus> {
        self.lock_state().status
    }

    /// Correlation id propagated through logs for this task.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.lock_state().correlation_id
    }

    /// Retries consumed so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.lock_state().retry_count
    }

    /// Earliest instant the task may next run.
    #[must_use]
    pub fn resume_at(&self) -> DateTime<Utc> {
        self.lock_state().resume_at
    }

    /// Cumulative time spent inside iterations.
    #[must_use]
    pub fn executed(&self) -> Duration {
        self.lock_state().executed
    }

    /// Most recent error message, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub(crate) fn set_id(&self, id: i64) {
        self.lock_state().id = id;
    }

    pub(crate) fn persisted(&self) -> bool {
        self.lock_state().persisted
    }

    pub(crate) fn mark_persisted(&self) {
        self.lock_state().persisted = true;
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.lock_state().status = Some(status);
    }

    pub(crate) fn set_resume_at(&self, resume_at: DateTime<Utc>) {
        self.lock_state().resume_at = resume_at;
    }

    pub(crate) fn add_executed(&self, elapsed: Duration) {
        let mut state = self.lock_state();
        state.executed = state.executed.saturating_add(elapsed);
    }

    pub(crate) fn record_error(&self, message: &str) {
        let mut state = self.lock_state();
        state.last_error = Some(message.to_string());
        state.error_history.push(message.to_string());
    }

    pub(crate) fn bump_retry(&self) -> u32 {
        let mut state = self.lock_state();
        state.retry_count += 1;
        state.retry_count
    }

    /// Snapshot the record into its persisted representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the task fails to serialise its private state.
    pub fn snapshot_row(&self) -> Result<TaskRow, TaskStateError> {
        let private_state = self.task.private_state()?;
        let state = self.lock_state();
        Ok(TaskRow {
            id: state.id,
            kind: self.task.kind().to_string(),
            status: state.status.unwrap_or(TaskStatus::Queued),
            correlation_id: state.correlation_id,
            owner_id: self.task.owner(),
            private_state,
            public_state: PublicState {
                retry_count: state.retry_count,
                executed_ms: u64::try_from(state.executed.as_millis()).unwrap_or(u64::MAX),
                last_error: state.last_error.clone(),
                error_history: state.error_history.clone(),
                resume_time: state.resume_at.timestamp(),
            },
            created_at: state.created_at,
            updated_at: Utc::now(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("task record mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}
