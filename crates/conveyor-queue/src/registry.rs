//! Process-local map of live task id to task record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::error;

use crate::record::TaskRecord;

/// Thread-safe registry of in-flight tasks, keyed by task id.
///
/// Entries are removed when a task reaches a terminal status. Transient ids
/// handed to non-persisted tasks are negative so they can never collide with
/// repository-assigned ids.
#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<HashMap<i64, Arc<TaskRecord>>>,
    next_transient: AtomicI64,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live task by id.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<Arc<TaskRecord>> {
        self.lock_inner().get(&id).cloned()
    }

    /// Snapshot the ids of all live tasks.
    #[must_use]
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock_inner().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().len()
    }

    /// Whether no tasks are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_inner().is_empty()
    }

    pub(crate) fn insert(&self, id: i64, record: Arc<TaskRecord>) {
        self.lock_inner().insert(id, record);
    }

    pub(crate) fn remove(&self, id: i64) -> Option<Arc<TaskRecord>> {
        self.lock_inner().remove(&id)
    }

    pub(crate) fn next_transient_id(&self) -> i64 {
        self.next_transient.fetch_sub(1, Ordering::Relaxed) - 1
    }

    fn lock_inner(&self) -> MutexGuard<'_, HashMap<i64, Arc<TaskRecord>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("task registry mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::task::{StepContext, StepError, StepOutcome, Task};

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

    #[test]
    fn transient_ids_are_negative_and_unique() {
        let registry = TaskRegistry::new();
        let first = registry.next_transient_id();
        let second = registry.next_transient_id();
        assert!(first < 0);
        assert!(second < first);
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let registry = TaskRegistry::new();
        let record = Arc::new(TaskRecord::new(Arc::new(NoopTask), Uuid::new_v4()));
        registry.insert(9, record);
        assert!(registry.get(9).is_some());
        assert_eq!(registry.ids(), vec![9]);
        assert!(registry.remove(9).is_some());
        assert!(registry.is_empty());
    }
}
