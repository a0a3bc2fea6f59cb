//! Postgres-backed task store.
//!
//! Every lifecycle transition is a single SQL statement, so no transition is
//! ever half-applied and no status/lock field is read-then-written.
//!
//! ## Claim protocol
//!
//! ```sql
//! UPDATE tasks SET status = 'in_progress', ...
//! WHERE id = (
//!     SELECT id FROM tasks
//!     WHERE status IN ('pending', 'retrying') AND scheduled_for <= $now
//!     ORDER BY priority DESC, scheduled_for ASC
//!     LIMIT 1
//!     FOR UPDATE SKIP LOCKED
//! )
//! RETURNING ...
//! ```
//!
//! The row lock taken by the sub-select is held until the update commits, and
//! concurrent claimers skip locked rows instead of waiting on them. Two
//! claimers therefore never receive the same task.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskStoreError |
//! |------------|----------------------|-----------------|
//! | Database (check violation) | `23514` | `Validation` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, field, instrument};

use taskq_core::{
    ClaimedTask, EnqueueOptions, FailureDisposition, Payload, Task, TaskId, TaskStatus, TaskType,
    WorkerId,
};

use super::store::{
    Pagination, QueueStats, TaskFilter, TaskStore, TaskStoreError, stale_cutoff,
    stale_lock_reason,
};

const MIGRATION: &str = include_str!("../../migrations/0001_create_tasks.sql");

const TASK_COLUMNS: &str = r#"
    id,
    task_type,
    payload,
    status,
    priority,
    attempts,
    max_attempts,
    locked_by,
    locked_at,
    scheduled_for,
    started_at,
    completed_at,
    result,
    last_error,
    created_at,
    updated_at
"#;

/// Postgres-backed task store.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and cheap to clone;
/// one store can be shared by every poll loop in the process, and any number
/// of processes can share the table.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    /// Create a new PostgresTaskStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `tasks` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), TaskStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, payload), fields(task_type = %task_type), err)]
    async fn insert_task(
        &self,
        task_type: TaskType,
        payload: Payload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let task = Task::new(task_type, payload, options, now)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (
                id,
                task_type,
                payload,
                status,
                priority,
                attempts,
                max_attempts,
                scheduled_for,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $8)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.id.as_uuid())
        .bind(task.task_type.as_str())
        .bind(task.payload.as_json())
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(to_db_count("max_attempts", task.max_attempts)?)
        .bind(task.scheduled_for)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        decode_task(&row)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn fetch_task(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_task).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR task_type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.task_type.map(|t| t.as_str()))
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_task).collect()
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self) -> Result<QueueStats, TaskStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM tasks GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| TaskStoreError::Decode(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| TaskStoreError::Decode(format!("failed to read count: {e}")))?;
            stats.record(status.parse::<TaskStatus>()?, total.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(
        skip(self),
        fields(worker_id = %worker, task_id = field::Empty, attempt = field::Empty),
        err
    )]
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, TaskStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'in_progress',
                locked_by = $1,
                locked_at = $2,
                started_at = $2,
                attempts = attempts + 1,
                updated_at = $2
            WHERE id = (
                SELECT id
                FROM tasks
                WHERE status IN ('pending', 'retrying')
                    AND scheduled_for <= $2
                ORDER BY priority DESC, scheduled_for ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_type, payload, attempts, max_attempts
            "#,
        )
        .bind(worker.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let claimed = ClaimedRow::from_row(&row)
            .map_err(|e| TaskStoreError::Decode(format!("failed to deserialize claimed row: {e}")))?
            .into_claimed(worker.clone())?;

        let span = Span::current();
        span.record("task_id", field::display(claimed.id));
        span.record("attempt", claimed.attempts);
        Ok(Some(claimed))
    }

    #[instrument(skip(self), fields(reaped = field::Empty), err)]
    async fn reap_expired_locks(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError> {
        // Tasks on their last attempt fail here; the interrupted attempt counts.
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'retrying' END,
                last_error = CASE WHEN attempts >= max_attempts THEN $3 ELSE last_error END,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $1
            WHERE status = 'in_progress'
                AND locked_at <= $2
            "#,
        )
        .bind(now)
        .bind(stale_cutoff(now, stale_after))
        .bind(stale_lock_reason(stale_after))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_stale_locks", e))?;

        let reaped = result.rows_affected();
        Span::current().record("reaped", reaped);
        Ok(reaped)
    }

    #[instrument(skip(self, task, result), fields(task_id = %task.id, worker_id = %task.locked_by), err)]
    async fn mark_completed(
        &self,
        task: &ClaimedTask,
        result: Payload,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed',
                result = $3,
                completed_at = $4,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $4
            WHERE id = $1
                AND status = 'in_progress'
                AND locked_by = $2
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.locked_by.as_str())
        .bind(result.as_json())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self, task, error), fields(task_id = %task.id, worker_id = %task.locked_by), err)]
    async fn mark_failed(
        &self,
        task: &ClaimedTask,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let query = match disposition {
            FailureDisposition::Retry { scheduled_for } => sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'retrying',
                    last_error = $3,
                    scheduled_for = GREATEST(scheduled_for, $5),
                    locked_by = NULL,
                    locked_at = NULL,
                    updated_at = $4
                WHERE id = $1
                    AND status = 'in_progress'
                    AND locked_by = $2
                "#,
            )
            .bind(task.id.as_uuid())
            .bind(task.locked_by.as_str())
            .bind(error)
            .bind(now)
            .bind(scheduled_for),
            FailureDisposition::Exhausted => sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'failed',
                    last_error = $3,
                    locked_by = NULL,
                    locked_at = NULL,
                    updated_at = $4
                WHERE id = $1
                    AND status = 'in_progress'
                    AND locked_by = $2
                "#,
            )
            .bind(task.id.as_uuid())
            .bind(task.locked_by.as_str())
            .bind(error)
            .bind(now),
        };

        let done = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_failure", e))?;

        Ok(done.rows_affected() == 1)
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Payload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        self.insert_task(task_type, payload, options, now).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        self.fetch_task(id).await
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskStoreError> {
        self.list_tasks(filter, pagination).await
    }

    async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        self.count_by_status().await
    }

    async fn claim(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, TaskStoreError> {
        self.claim_next(worker, now).await
    }

    async fn reap_stale_locks(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError> {
        self.reap_expired_locks(stale_after, now).await
    }

    async fn complete(
        &self,
        task: &ClaimedTask,
        result: Payload,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        self.mark_completed(task, result, now).await
    }

    async fn record_failure(
        &self,
        task: &ClaimedTask,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        self.mark_failed(task, error, disposition, now).await
    }
}

/// Map SQLx errors to TaskStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => TaskStoreError::Validation(msg),
                _ => TaskStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            TaskStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => TaskStoreError::Unavailable(format!("io error in {operation}: {e}")),
        _ => TaskStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn to_db_count(field: &str, value: u32) -> Result<i32, TaskStoreError> {
    i32::try_from(value)
        .map_err(|_| TaskStoreError::Validation(format!("{field} out of range: {value}")))
}

fn from_db_count(field: &str, value: i32) -> Result<u32, TaskStoreError> {
    u32::try_from(value)
        .map_err(|_| TaskStoreError::Decode(format!("{field} is negative: {value}")))
}

fn decode_task(row: &sqlx::postgres::PgRow) -> Result<Task, TaskStoreError> {
    TaskRow::from_row(row)
        .map_err(|e| TaskStoreError::Decode(format!("failed to deserialize task row: {e}")))?
        .try_into()
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    task_type: String,
    payload: serde_json::Value,
    status: String,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    scheduled_for: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for TaskRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            scheduled_for: row.try_get("scheduled_for")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            result: row.try_get("result")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            task_type: row.task_type.parse()?,
            payload: Payload::new(row.payload),
            status: row.status.parse()?,
            priority: row.priority,
            attempts: from_db_count("attempts", row.attempts)?,
            max_attempts: from_db_count("max_attempts", row.max_attempts)?,
            locked_by: row
                .locked_by
                .map(WorkerId::new)
                .transpose()
                .map_err(|e| TaskStoreError::Decode(e.to_string()))?,
            locked_at: row.locked_at,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result.map(Payload::new),
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct ClaimedRow {
    id: uuid::Uuid,
    task_type: String,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ClaimedRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ClaimedRow {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
        })
    }
}

impl ClaimedRow {
    fn into_claimed(self, locked_by: WorkerId) -> Result<ClaimedTask, TaskStoreError> {
        Ok(ClaimedTask {
            id: TaskId::from_uuid(self.id),
            task_type: self.task_type.parse()?,
            payload: Payload::new(self.payload),
            attempts: from_db_count("attempts", self.attempts)?,
            max_attempts: from_db_count("max_attempts", self.max_attempts)?,
            locked_by,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_defines_claim_and_reaper_indexes() {
        assert!(MIGRATION.contains("CREATE TABLE IF NOT EXISTS tasks"));
        assert!(MIGRATION.contains("tasks_claimable_idx"));
        assert!(MIGRATION.contains("tasks_in_progress_locked_at_idx"));
    }

    #[test]
    fn migration_check_constraints_cover_every_tag() {
        for t in TaskType::ALL {
            assert!(MIGRATION.contains(&format!("'{}'", t.as_str())), "missing {t}");
        }
        for s in TaskStatus::ALL {
            assert!(MIGRATION.contains(&format!("'{}'", s.as_str())), "missing {s}");
        }
    }

    #[test]
    fn pool_errors_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::PoolTimedOut),
            TaskStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::PoolClosed),
            TaskStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::RowNotFound),
            TaskStoreError::Storage(_)
        ));
    }

    #[test]
    fn negative_counts_fail_to_decode() {
        assert!(matches!(
            from_db_count("attempts", -1),
            Err(TaskStoreError::Decode(_))
        ));
        assert_eq!(to_db_count("max_attempts", 3).unwrap(), 3);
        assert!(to_db_count("max_attempts", u32::MAX).is_err());
    }
}
