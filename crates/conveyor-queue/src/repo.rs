//! Task persistence seam.
//!
//! The engine persists every status transition through this trait. The
//! Postgres implementation lives in `conveyor-data`; the in-memory
//! implementation here backs tests and non-durable deployments.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use chrono::Utc;
use tracing::error;

use crate::status::TaskStatus;
use crate::task::TaskRow;

/// Result alias for repository operations.
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Errors raised by task persistence.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No row exists under the requested id.
    #[error("task row not found")]
    NotFound {
        /// Identifier that had no row.
        id: i64,
    },
    /// The backing store failed.
    #[error("task store operation failed")]
    Backend {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying store failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

/// Persistence operations required by the queue engine.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new row, assigning its id and timestamps in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    async fn create(&self, row: &mut TaskRow) -> RepoResult<()>;

    /// Write the row's status, public state, and private state back by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is missing or the write fails.
    async fn update(&self, row: &TaskRow) -> RepoResult<()>;

    /// Fetch a row by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn get(&self, id: i64) -> RepoResult<Option<TaskRow>>;

    /// All non-deleted rows whose status is non-terminal and whose kind is
    /// in `kinds`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn pending(&self, kinds: &[String]) -> RepoResult<Vec<TaskRow>>;

    /// Soft-delete a row by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    async fn delete(&self, id: i64) -> RepoResult<()>;
}

/// In-memory task repository.
///
/// State does not survive the process; useful for tests and deployments
/// that opt out of durability.
#[derive(Default)]
pub struct MemoryTaskRepository {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<i64, TaskRow>,
    next_id: i64,
}

impl MemoryTaskRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing the engine; used to simulate state
    /// left behind by a previous process.
    pub fn seed(&self, mut row: TaskRow) -> i64 {
        let mut state = self.lock_state();
        if row.id <= 0 {
            state.next_id += 1;
            row.id = state.next_id;
        } else {
            state.next_id = state.next_id.max(row.id);
        }
        let id = row.id;
        state.rows.insert(id, row);
        id
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("memory repository mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, row: &mut TaskRow) -> RepoResult<()> {
        let mut state = self.lock_state();
        state.next_id += 1;
        row.id = state.next_id;
        let now = Utc::now();
        row.created_at = now;
        row.updated_at = now;
        state.rows.insert(row.id, row.clone());
        Ok(())
    }

    async fn update(&self, row: &TaskRow) -> RepoResult<()> {
        let mut state = self.lock_state();
        let Some(stored) = state.rows.get_mut(&row.id) else {
            return Err(RepositoryError::NotFound { id: row.id });
        };
        stored.status = row.status;
        stored.public_state = row.public_state.clone();
        stored.private_state = row.private_state.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: i64) -> RepoResult<Option<TaskRow>> {
        Ok(self.lock_state().rows.get(&id).cloned())
    }

    async fn pending(&self, kinds: &[String]) -> RepoResult<Vec<TaskRow>> {
        let state = self.lock_state();
        let mut rows: Vec<TaskRow> = state
            .rows
            .values()
            .filter(|row| {
                matches!(
                    row.status,
                    TaskStatus::Queued | TaskStatus::Processing | TaskStatus::Suspending
                ) && kinds.iter().any(|kind| kind == &row.kind)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn delete(&self, id: i64) -> RepoResult<()> {
        self.lock_state().rows.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PublicState;
    use uuid::Uuid;

    fn row(kind: &str, status: TaskStatus) -> TaskRow {
        TaskRow {
            id: 0,
            kind: kind.to_string(),
            status,
            correlation_id: Uuid::new_v4(),
            owner_id: None,
            private_state: None,
            public_state: PublicState::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_ids() {
        let repo = MemoryTaskRepository::new();
        let mut first = row("a", TaskStatus::Queued);
        let mut second = row("a", TaskStatus::Queued);
        repo.create(&mut first).await.unwrap();
        repo.create(&mut second).await.unwrap();
        assert!(second.id > first.id);
        assert!(repo.get(first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_filters_by_kind_and_status() {
        let repo = MemoryTaskRepository::new();
        repo.seed(row("keep", TaskStatus::Suspending));
        repo.seed(row("keep", TaskStatus::Completed));
        repo.seed(row("skip", TaskStatus::Queued));

        let rows = repo.pending(&["keep".to_string()]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskStatus::Suspending);
    }

    #[tokio::test]
    async fn delete_is_soft() {
        let repo = MemoryTaskRepository::new();
        let id = repo.seed(row("a", TaskStatus::Queued));
        repo.delete(id).await.unwrap();
        assert!(repo.get(id).await.unwrap().is_none());
        assert!(repo.pending(&["a".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_unknown_row_errors() {
        let repo = MemoryTaskRepository::new();
        let missing = row("a", TaskStatus::Queued);
        let result = repo.update(&missing).await;
        assert!(matches!(result, Err(RepositoryError::NotFound { .. })));
    }
}
