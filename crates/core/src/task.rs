//! The task record and its lifecycle.
//!
//! ```text
//! pending ──┐
//!           ├─> in_progress ──success──────────────> completed
//! retrying ─┘        │
//!    ▲               ├──failure, attempts < max──> retrying (scheduled_for = now + backoff)
//!    │               └──failure, attempts >= max─> failed
//!    └──── stale-lock reap (in_progress, locked_at <= now - ttl) ────┘
//! ```
//!
//! The transition methods here are the in-process rendition of the store's
//! atomic writes. Stores apply exactly one of them per write.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{TaskId, WorkerId};
use crate::payload::Payload;
use crate::retry::FailureDisposition;

/// Attempts granted to a task unless the enqueuer says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Task type tag selecting the handler. Closed set known at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Fetch listings from an external job board.
    JobFetch,
    /// Score a CV against stored preferences.
    Matching,
    /// Render a CSV export.
    CsvGeneration,
    /// Send an email.
    EmailDelivery,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::JobFetch,
        TaskType::Matching,
        TaskType::CsvGeneration,
        TaskType::EmailDelivery,
    ];

    /// Stable storage tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::JobFetch => "job_fetch",
            TaskType::Matching => "matching",
            TaskType::CsvGeneration => "csv_generation",
            TaskType::EmailDelivery => "email_delivery",
        }
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::UnknownTaskType(s.to_string()))
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued, never claimed
    Pending,
    /// Claimed and locked by a worker
    InProgress,
    /// Failed or reaped, waiting for its next eligibility
    Retrying,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Retrying,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// `pending` and `retrying` are the only unlocked, non-terminal states.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

/// Optional knobs accepted by enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Higher claims first
    pub priority: i32,
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    /// Earliest eligibility; `None` means now
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_for: None,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// Business fields handed to a worker by a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Payload,
    /// Attempt count including the one just started.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Worker holding the lock; completion/failure writes are guarded by it.
    pub locked_by: WorkerId,
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Payload,
    pub status: TaskStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new `pending` task.
    pub fn new(
        task_type: TaskType,
        payload: Payload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if options.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }

        Ok(Self {
            id: TaskId::new(),
            task_type,
            payload,
            status: TaskStatus::Pending,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.max_attempts,
            locked_by: None,
            locked_at: None,
            scheduled_for: options.scheduled_for.unwrap_or(now),
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Eligible for claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_for <= now
    }

    /// Lock held since at or before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == TaskStatus::InProgress && self.locked_at.is_some_and(|at| at <= cutoff)
    }

    fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.status == TaskStatus::InProgress && self.locked_by.as_ref() == Some(worker)
    }

    /// Lock the task for `worker` and count the attempt.
    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> DomainResult<ClaimedTask> {
        if !self.is_claimable(now) {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                TaskStatus::InProgress.as_str(),
            ));
        }

        self.status = TaskStatus::InProgress;
        self.locked_by = Some(worker.clone());
        self.locked_at = Some(now);
        self.started_at = Some(now);
        self.attempts += 1;
        self.updated_at = now;

        Ok(ClaimedTask {
            id: self.id,
            task_type: self.task_type,
            payload: self.payload.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            locked_by: worker.clone(),
        })
    }

    /// Record success. Returns `false` (and changes nothing) unless `worker`
    /// still holds the lock.
    pub fn complete(&mut self, worker: &WorkerId, result: Payload, now: DateTime<Utc>) -> bool {
        if !self.is_held_by(worker) {
            return false;
        }

        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.release(now);
        true
    }

    /// Record a failed attempt. Returns `false` (and changes nothing) unless
    /// `worker` still holds the lock.
    pub fn record_failure(
        &mut self,
        worker: &WorkerId,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_held_by(worker) {
            return false;
        }

        self.last_error = Some(error.to_string());
        match disposition {
            FailureDisposition::Retry { scheduled_for } => {
                self.status = TaskStatus::Retrying;
                self.scheduled_for = self.scheduled_for.max(scheduled_for);
            }
            FailureDisposition::Exhausted => {
                self.status = TaskStatus::Failed;
            }
        }
        self.release(now);
        true
    }

    /// Return a stale `in_progress` task to the queue.
    ///
    /// The interrupted attempt stays counted. A task that already used its
    /// last attempt is failed with `reason` instead of becoming `retrying`.
    pub fn reap(&mut self, reason: &str, now: DateTime<Utc>) {
        if self.status != TaskStatus::InProgress {
            return;
        }

        if self.attempts >= self.max_attempts {
            self.status = TaskStatus::Failed;
            self.last_error = Some(reason.to_string());
        } else {
            self.status = TaskStatus::Retrying;
        }
        self.release(now);
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.locked_by = None;
        self.locked_at = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn worker() -> WorkerId {
        WorkerId::new("w1").unwrap()
    }

    fn new_task(max_attempts: u32) -> Task {
        Task::new(
            TaskType::Matching,
            Payload::new(serde_json::json!({"cv_id": 1})),
            EnqueueOptions::default().with_max_attempts(max_attempts),
            t0(),
        )
        .unwrap()
    }

    #[test]
    fn tags_round_trip() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
        for s in TaskStatus::ALL {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
        assert!(matches!(
            "pdf_render".parse::<TaskType>(),
            Err(DomainError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn new_task_defaults() {
        let task = new_task(3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 0);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.scheduled_for, t0());
        assert!(task.locked_by.is_none());
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let err = Task::new(
            TaskType::JobFetch,
            Payload::null(),
            EnqueueOptions::default().with_max_attempts(0),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn claim_locks_and_counts_attempt() {
        let mut task = new_task(3);
        let claimed = task.claim(&worker(), t0()).unwrap();

        assert_eq!(claimed.attempts, 1);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.locked_by, Some(worker()));
        assert_eq!(task.locked_at, Some(t0()));
        assert_eq!(task.started_at, Some(t0()));

        // Already locked: not claimable again.
        assert!(task.claim(&worker(), t0()).is_err());
    }

    #[test]
    fn future_tasks_are_not_claimable() {
        let mut task = new_task(3);
        task.scheduled_for = t0() + Duration::seconds(10);
        assert!(!task.is_claimable(t0()));
        assert!(task.is_claimable(t0() + Duration::seconds(10)));
    }

    #[test]
    fn failure_with_attempts_left_goes_to_retrying() {
        let mut task = new_task(3);
        task.claim(&worker(), t0()).unwrap();

        let later = t0() + Duration::seconds(5);
        let applied = task.record_failure(
            &worker(),
            "boom",
            FailureDisposition::Retry { scheduled_for: later },
            t0(),
        );

        assert!(applied);
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.scheduled_for, later);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert!(task.locked_by.is_none() && task.locked_at.is_none());
    }

    #[test]
    fn exhausted_failure_is_terminal() {
        let mut task = new_task(1);
        task.claim(&worker(), t0()).unwrap();
        task.record_failure(&worker(), "boom", FailureDisposition::Exhausted, t0());

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.is_claimable(t0() + Duration::days(365)));
    }

    #[test]
    fn writes_from_a_worker_without_the_lock_are_ignored() {
        let mut task = new_task(3);
        task.claim(&worker(), t0()).unwrap();

        let other = WorkerId::new("w2").unwrap();
        assert!(!task.complete(&other, Payload::null(), t0()));
        assert_eq!(task.status, TaskStatus::InProgress);

        assert!(task.complete(&worker(), Payload::null(), t0()));
        // Second completion is a no-op.
        assert!(!task.complete(&worker(), Payload::null(), t0()));
    }

    #[test]
    fn reap_keeps_attempt_count() {
        let mut task = new_task(3);
        task.claim(&worker(), t0()).unwrap();
        task.reap("lock expired", t0() + Duration::minutes(6));

        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.attempts, 1);
        assert!(task.locked_by.is_none() && task.locked_at.is_none());
        assert!(task.last_error.is_none());
    }

    #[test]
    fn reap_of_last_attempt_fails_the_task() {
        let mut task = new_task(1);
        task.claim(&worker(), t0()).unwrap();
        task.reap("lock expired", t0() + Duration::minutes(6));

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("lock expired"));
    }

    #[test]
    fn staleness_uses_locked_at() {
        let mut task = new_task(3);
        task.claim(&worker(), t0()).unwrap();

        assert!(task.is_stale(t0()));
        assert!(!task.is_stale(t0() - Duration::seconds(1)));
    }
}
