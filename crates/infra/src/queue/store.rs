//! Task storage contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskq_core::{
    ClaimedTask, DomainError, EnqueueOptions, FailureDisposition, Payload, Task, TaskId,
    TaskStatus, TaskType, WorkerId,
};

/// Task store abstraction.
///
/// Each mutating method is one atomic transition: it writes every field that
/// belongs to the transition or nothing at all. There is no generic "update
/// task" operation on purpose; callers never read-then-write status or lock
/// fields.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Enqueue a new `pending` task.
    async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Payload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError>;

    /// Get a task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// List tasks, newest first.
    async fn list(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskStoreError>;

    /// Count tasks per status.
    async fn stats(&self) -> Result<QueueStats, TaskStoreError>;

    /// Lock the next eligible task for `worker`.
    ///
    /// Eligible: `pending`/`retrying` with `scheduled_for <= now`, ordered by
    /// priority descending then `scheduled_for` ascending. Concurrent callers
    /// never receive the same task. Returns `None` when nothing is eligible.
    async fn claim(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, TaskStoreError>;

    /// Return every `in_progress` task locked at or before `now - stale_after`
    /// to the queue. Returns how many tasks were recovered.
    async fn reap_stale_locks(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError>;

    /// Success write. `false` means the worker no longer held the lock and
    /// nothing was written.
    async fn complete(
        &self,
        task: &ClaimedTask,
        result: Payload,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError>;

    /// Failure write (retry or terminal, per `disposition`). `false` means the
    /// worker no longer held the lock and nothing was written.
    async fn record_failure(
        &self,
        task: &ClaimedTask,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("invalid task: {0}")]
    Validation(String),
    #[error("failed to decode task row: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for TaskStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::UnknownTaskType(_) | DomainError::UnknownStatus(_) => {
                TaskStoreError::Decode(err.to_string())
            }
            other => TaskStoreError::Validation(other.to_string()),
        }
    }
}

/// `last_error` written when a task on its last attempt is reaped.
pub fn stale_lock_reason(stale_after: Duration) -> String {
    format!(
        "lock expired: no outcome reported within {}s",
        stale_after.as_secs()
    )
}

/// Inspection filter. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.task_type.is_none_or(|t| t == task.task_type)
    }
}

/// Pagination parameters for inspection queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of tasks to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Queue depth per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_progress: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn record(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::Retrying => self.retrying += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.retrying + self.completed + self.failed
    }
}

/// In-memory task store for tests/dev.
///
/// Every operation runs under one lock, which gives the same atomicity the
/// Postgres store gets from single statements.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a task as-is (fixtures for tests and benches).
    pub fn insert(&self, task: Task) -> Result<(), TaskStoreError> {
        let mut tasks = self.write()?;
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::Validation(format!(
                "task already exists: {}",
                task.id
            )));
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TaskId, Task>>, TaskStoreError> {
        self.tasks
            .read()
            .map_err(|_| TaskStoreError::Storage("task map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TaskId, Task>>, TaskStoreError> {
        self.tasks
            .write()
            .map_err(|_| TaskStoreError::Storage("task map lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Payload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        let task = Task::new(task_type, payload, options, now)?;
        self.insert(task.clone())?;
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.read()?;
        let mut result: Vec<_> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(result
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        let tasks = self.read()?;
        let mut stats = QueueStats::default();
        for task in tasks.values() {
            stats.record(task.status, 1);
        }
        Ok(stats)
    }

    async fn claim(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, TaskStoreError> {
        let mut tasks = self.write()?;

        let next = tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_for.cmp(&b.scheduled_for))
                    .then(a.id.cmp(&b.id))
            })
            .map(|t| t.id);

        let Some(id) = next else {
            return Ok(None);
        };

        match tasks.get_mut(&id) {
            Some(task) => Ok(Some(task.claim(worker, now)?)),
            None => Ok(None),
        }
    }

    async fn reap_stale_locks(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError> {
        let cutoff = stale_cutoff(now, stale_after);
        let reason = stale_lock_reason(stale_after);
        let mut tasks = self.write()?;

        let mut reaped = 0;
        for task in tasks.values_mut().filter(|t| t.is_stale(cutoff)) {
            task.reap(&reason, now);
            reaped += 1;
        }
        Ok(reaped)
    }

    async fn complete(
        &self,
        task: &ClaimedTask,
        result: Payload,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let mut tasks = self.write()?;
        Ok(tasks
            .get_mut(&task.id)
            .is_some_and(|t| t.complete(&task.locked_by, result, now)))
    }

    async fn record_failure(
        &self,
        task: &ClaimedTask,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let mut tasks = self.write()?;
        Ok(tasks
            .get_mut(&task.id)
            .is_some_and(|t| t.record_failure(&task.locked_by, error, disposition, now)))
    }
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Payload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError> {
        (**self).enqueue(task_type, payload, options, now).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(id).await
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list(filter, pagination).await
    }

    async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        (**self).stats().await
    }

    async fn claim(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, TaskStoreError> {
        (**self).claim(worker, now).await
    }

    async fn reap_stale_locks(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError> {
        (**self).reap_stale_locks(stale_after, now).await
    }

    async fn complete(
        &self,
        task: &ClaimedTask,
        result: Payload,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        (**self).complete(task, result, now).await
    }

    async fn record_failure(
        &self,
        task: &ClaimedTask,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        (**self).record_failure(task, error, disposition, now).await
    }
}

/// `now - stale_after`; locks taken at or before this instant are stale.
pub(crate) fn stale_cutoff(now: DateTime<Utc>, stale_after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
