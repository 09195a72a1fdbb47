//! Database-backed task repository used by the queue engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};
use uuid::Uuid;

use conveyor_queue::{
    PublicState, RepoResult, RepositoryError, TaskRepository, TaskRow, TaskStatus,
};

use crate::error::{DataError, Result as DataResult};

const INSERT_TASK_SQL: &str = r"
    INSERT INTO tasks (
        kind,
        status,
        correlation_id,
        owner_id,
        private_state,
        public_retry_count,
        public_executed_ms,
        public_error,
        public_error_history,
        public_resume_time
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    RETURNING id, created_at, updated_at
";

const UPDATE_TASK_SQL: &str = r"
    UPDATE tasks
    SET
        status = $2,
        private_state = $3,
        public_retry_count = $4,
        public_executed_ms = $5,
        public_error = $6,
        public_error_history = $7,
        public_resume_time = $8,
        updated_at = now()
    WHERE id = $1 AND deleted_at IS NULL
";

const SELECT_TASK_SQL: &str = r"
    SELECT
        id,
        kind,
        status,
        correlation_id,
        owner_id,
        private_state,
        public_retry_count,
        public_executed_ms,
        public_error,
        public_error_history,
        public_resume_time,
        created_at,
        updated_at
    FROM tasks
    WHERE id = $1 AND deleted_at IS NULL
";

const SELECT_PENDING_SQL: &str = r"
    SELECT
        id,
        kind,
        status,
        correlation_id,
        owner_id,
        private_state,
        public_retry_count,
        public_executed_ms,
        public_error,
        public_error_history,
        public_resume_time,
        created_at,
        updated_at
    FROM tasks
    WHERE status IN ('queued', 'processing', 'suspending')
      AND kind = ANY($1)
      AND deleted_at IS NULL
    ORDER BY id
";

const DELETE_TASK_SQL: &str = r"
    UPDATE tasks
    SET deleted_at = now()
    WHERE id = $1 AND deleted_at IS NULL
";

/// Postgres implementation of the queue's task repository.
#[derive(Clone)]
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    /// Initialise the repository, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail or the database is unreachable.
    pub async fn new(pool: PgPool) -> DataResult<Self> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&pool)
            .await
            .map_err(|source| DataError::MigrationFailed { source })?;
        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn create(&self, row: &mut TaskRow) -> RepoResult<()> {
        let assigned = sqlx::query(INSERT_TASK_SQL)
            .bind(&row.kind)
            .bind(row.status.as_str())
            .bind(row.correlation_id)
            .bind(row.owner_id)
            .bind(row.private_state.as_deref())
            .bind(clamp_u32(row.public_state.retry_count))
            .bind(clamp_i64(row.public_state.executed_ms))
            .bind(row.public_state.last_error.as_deref())
            .bind(Json(&row.public_state.error_history))
            .bind(row.public_state.resume_time)
            .fetch_one(&self.pool)
            .await
            .map_err(|source| backend("tasks.create", source))?;

        row.id = assigned
            .try_get("id")
            .map_err(|source| backend("tasks.create", source))?;
        row.created_at = assigned
            .try_get("created_at")
            .map_err(|source| backend("tasks.create", source))?;
        row.updated_at = assigned
            .try_get("updated_at")
            .map_err(|source| backend("tasks.create", source))?;
        Ok(())
    }

    async fn update(&self, row: &TaskRow) -> RepoResult<()> {
        let result = sqlx::query(UPDATE_TASK_SQL)
            .bind(row.id)
            .bind(row.status.as_str())
            .bind(row.private_state.as_deref())
            .bind(clamp_u32(row.public_state.retry_count))
            .bind(clamp_i64(row.public_state.executed_ms))
            .bind(row.public_state.last_error.as_deref())
            .bind(Json(&row.public_state.error_history))
            .bind(row.public_state.resume_time)
            .execute(&self.pool)
            .await
            .map_err(|source| backend("tasks.update", source))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { id: row.id });
        }
        Ok(())
    }

    async fn get(&self, id: i64) -> RepoResult<Option<TaskRow>> {
        let row = sqlx::query(SELECT_TASK_SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| backend("tasks.get", source))?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn pending(&self, kinds: &[String]) -> RepoResult<Vec<TaskRow>> {
        let rows = sqlx::query(SELECT_PENDING_SQL)
            .bind(kinds)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| backend("tasks.pending", source))?;
        rows.iter().map(decode_row).collect()
    }

    async fn delete(&self, id: i64) -> RepoResult<()> {
        sqlx::query(DELETE_TASK_SQL)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|source| backend("tasks.delete", source))?;
        Ok(())
    }
}

fn backend(operation: &'static str, source: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend {
        operation,
        source: Box::new(DataError::QueryFailed { operation, source }),
    }
}

fn decode_row(row: &PgRow) -> RepoResult<TaskRow> {
    let decode = |source: sqlx::Error| backend("tasks.decode", source);

    let status_label: String = row.try_get("status").map_err(decode)?;
    let status = TaskStatus::parse(&status_label).ok_or_else(|| RepositoryError::Backend {
        operation: "tasks.decode",
        source: Box::new(DataError::UnknownStatus {
            value: status_label,
        }),
    })?;

    let Json(error_history): Json<Vec<String>> =
        row.try_get("public_error_history").map_err(decode)?;
    let retry_count: i32 = row.try_get("public_retry_count").map_err(decode)?;
    let executed_ms: i64 = row.try_get("public_executed_ms").map_err(decode)?;

    Ok(TaskRow {
        id: row.try_get("id").map_err(decode)?,
        kind: row.try_get("kind").map_err(decode)?,
        status,
        correlation_id: row.try_get::<Uuid, _>("correlation_id").map_err(decode)?,
        owner_id: row.try_get("owner_id").map_err(decode)?,
        private_state: row.try_get("private_state").map_err(decode)?,
        public_state: PublicState {
            retry_count: u32::try_from(retry_count).unwrap_or_default(),
            executed_ms: u64::try_from(executed_ms).unwrap_or_default(),
            last_error: row.try_get("public_error").map_err(decode)?,
            error_history,
            resume_time: row.try_get("public_resume_time").map_err(decode)?,
        },
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(decode)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(decode)?,
    })
}

fn clamp_u32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
