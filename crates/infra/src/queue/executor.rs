//! Poll loop: reap stale locks, claim, dispatch, record the outcome.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use taskq_core::{ClaimedTask, FailureDisposition, Payload, RetryPolicy, TaskId, TaskType, WorkerId};

use super::registry::{HandlerError, HandlerRegistry};
use super::store::TaskStore;
use crate::clock::{Clock, SystemClock};

/// Shortest tick interval; tokio's interval timer rejects zero.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Poll loop configuration.
#[derive(Debug, Clone)]
pub struct PollLoopConfig {
    /// Wall-clock interval between ticks, never below [`MIN_INTERVAL`]
    pub interval: Duration,
    /// Locks older than this are presumed dead
    pub stale_after: Duration,
    /// Maximum tasks claimed and processed in one tick
    pub claims_per_tick: usize,
    /// Backoff between attempts
    pub retry_policy: RetryPolicy,
    /// Fail tasks with no registered handler immediately instead of spending
    /// their retry budget
    pub unknown_type_permanent: bool,
}

impl Default for PollLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(5 * 60),
            claims_per_tick: 1,
            retry_policy: RetryPolicy::default(),
            unknown_type_permanent: false,
        }
    }
}

impl PollLoopConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_claims_per_tick(mut self, claims: usize) -> Self {
        self.claims_per_tick = claims.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Loop runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub reaped: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub lock_lost: u64,
    pub store_errors: u64,
}

/// What became of one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retrying { scheduled_for: DateTime<Utc> },
    Failed,
    /// The outcome write matched no row: the lock had been reaped.
    LockLost,
    /// The outcome write itself failed; the reaper will recover the task.
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: u64,
    pub processed: Vec<ProcessedTask>,
    /// Set when the reaper or a claim failed and the tick ended early.
    pub store_error: Option<String>,
}

/// Single-threaded cooperative poll loop for one worker process.
///
/// Any number of loops (in one process or many) may share a store; claim
/// atomicity is what keeps them from processing the same task.
pub struct PollLoop<S, C = SystemClock> {
    worker_id: WorkerId,
    store: S,
    registry: Arc<HandlerRegistry>,
    config: PollLoopConfig,
    clock: C,
    stats: Arc<Mutex<LoopStats>>,
}

impl<S: TaskStore> PollLoop<S, SystemClock> {
    pub fn new(
        worker_id: WorkerId,
        store: S,
        registry: Arc<HandlerRegistry>,
        config: PollLoopConfig,
    ) -> Self {
        Self {
            worker_id,
            store,
            registry,
            config,
            clock: SystemClock,
            stats: Arc::new(Mutex::new(LoopStats::default())),
        }
    }
}

impl<S: TaskStore, C: Clock> PollLoop<S, C> {
    /// Swap the time source (tests drive a `ManualClock`).
    pub fn with_clock<D: Clock>(self, clock: D) -> PollLoop<S, D> {
        PollLoop {
            worker_id: self.worker_id,
            store: self.store,
            registry: self.registry,
            config: self.config,
            clock,
            stats: self.stats,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PollLoopConfig {
        &self.config
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn bump(&self, f: impl FnOnce(&mut LoopStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Run one tick: reap, then claim and process up to `claims_per_tick`
    /// tasks one after another.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        self.bump(|s| s.ticks += 1);

        match self
            .store
            .reap_stale_locks(self.config.stale_after, self.clock.now())
            .await
        {
            Ok(0) => {}
            Ok(n) => {
                warn!(worker_id = %self.worker_id, reaped = n, "recovered tasks with stale locks");
                report.reaped = n;
                self.bump(|s| s.reaped += n);
            }
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "failed to reap stale locks");
                self.bump(|s| s.store_errors += 1);
                report.store_error = Some(e.to_string());
                return report;
            }
        }

        for _ in 0..self.config.claims_per_tick.max(1) {
            let task = match self.store.claim(&self.worker_id, self.clock.now()).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "failed to claim task");
                    self.bump(|s| s.store_errors += 1);
                    report.store_error = Some(e.to_string());
                    break;
                }
            };

            self.bump(|s| s.claimed += 1);
            debug!(
                worker_id = %self.worker_id,
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                "claimed task"
            );

            let outcome = self.process(&task).await;
            report.processed.push(ProcessedTask {
                id: task.id,
                task_type: task.task_type,
                attempt: task.attempts,
                outcome,
            });
        }

        report
    }

    /// Dispatch one claimed task and write its outcome.
    async fn process(&self, task: &ClaimedTask) -> TaskOutcome {
        let Some(handler) = self.registry.get(task.task_type) else {
            let error = format!("unknown task type: {}", task.task_type);
            warn!(task_id = %task.id, task_type = %task.task_type, "no handler for task");
            let disposition = if self.config.unknown_type_permanent {
                FailureDisposition::Exhausted
            } else {
                self.config
                    .retry_policy
                    .on_failure(task.attempts, task.max_attempts, self.clock.now())
            };
            return self.write_failure(task, &error, disposition).await;
        };

        let handler = Arc::clone(handler);
        let payload = task.payload.clone();
        // Run on its own task so a panicking handler becomes a failed attempt.
        let joined = tokio::spawn(async move { handler.handle(payload).await }).await;

        let result = match joined {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(join_err.into_panic())
            ))),
            Err(join_err) => Err(HandlerError::new(format!("handler aborted: {join_err}"))),
        };

        match result {
            Ok(output) => self.write_success(task, output).await,
            Err(err) => {
                let disposition = self.config.retry_policy.on_failure(
                    task.attempts,
                    task.max_attempts,
                    self.clock.now(),
                );
                self.write_failure(task, err.message(), disposition).await
            }
        }
    }

    async fn write_success(&self, task: &ClaimedTask, output: Payload) -> TaskOutcome {
        match self.store.complete(task, output, self.clock.now()).await {
            Ok(true) => {
                self.bump(|s| s.succeeded += 1);
                debug!(task_id = %task.id, attempt = task.attempts, "task completed");
                TaskOutcome::Completed
            }
            Ok(false) => self.lock_lost(task),
            Err(e) => self.write_failed(task, e.to_string()),
        }
    }

    async fn write_failure(
        &self,
        task: &ClaimedTask,
        error: &str,
        disposition: FailureDisposition,
    ) -> TaskOutcome {
        match self
            .store
            .record_failure(task, error, disposition, self.clock.now())
            .await
        {
            Ok(true) => match disposition {
                FailureDisposition::Retry { scheduled_for } => {
                    self.bump(|s| s.retried += 1);
                    info!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempt = task.attempts,
                        max_attempts = task.max_attempts,
                        %scheduled_for,
                        error,
                        "task failed, retry scheduled"
                    );
                    TaskOutcome::Retrying { scheduled_for }
                }
                FailureDisposition::Exhausted => {
                    self.bump(|s| s.failed += 1);
                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempts = task.attempts,
                        error,
                        "task failed permanently"
                    );
                    TaskOutcome::Failed
                }
            },
            Ok(false) => self.lock_lost(task),
            Err(e) => self.write_failed(task, e.to_string()),
        }
    }

    fn lock_lost(&self, task: &ClaimedTask) -> TaskOutcome {
        self.bump(|s| s.lock_lost += 1);
        warn!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            "lock no longer held, outcome discarded"
        );
        TaskOutcome::LockLost
    }

    fn write_failed(&self, task: &ClaimedTask, error: String) -> TaskOutcome {
        self.bump(|s| s.store_errors += 1);
        error!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            error = %error,
            "failed to record task outcome"
        );
        TaskOutcome::WriteFailed(error)
    }
}

impl<S, C> PollLoop<S, C>
where
    S: TaskStore + 'static,
    C: Clock + 'static,
{
    /// Spawn the loop on the current tokio runtime.
    ///
    /// The first tick runs immediately, then one every `interval`.
    ///
    /// The loop runs until the returned handle is stopped or dropped.
    /// Dropping the handle ends the loop after any tick in flight, unlike a
    /// bare `JoinHandle`, which would detach the task.
    pub fn start(self) -> PollLoopHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.run(shutdown_rx));

        PollLoopHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            interval_ms = self.config.interval.as_millis() as u64,
            claims_per_tick = self.config.claims_per_tick,
            "poll loop started"
        );

        let mut interval = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Only the wait between ticks is interruptible; a tick in flight
            // always runs to completion.
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    // Err: the handle was dropped
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            if *shutdown_rx.borrow() {
                break;
            }
            self.tick().await;
        }

        info!(worker_id = %self.worker_id, "poll loop stopped");
    }
}

/// Handle to control a running poll loop.
///
/// Owns the loop: dropping it stops the loop the same way [`stop`] does.
///
/// [`stop`]: PollLoopHandle::stop
#[derive(Debug)]
pub struct PollLoopHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<LoopStats>>,
}

impl PollLoopHandle {
    /// Prevent future ticks. A tick already running is not interrupted.
    pub fn stop(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown.send(true);
    }

    /// Stop, wait for the in-flight tick (if any) to finish, and return the
    /// final statistics.
    pub async fn shutdown(self) -> LoopStats {
        self.stop();
        if let Err(e) = self.join.await {
            error!(error = %e, "poll loop task ended abnormally");
        }
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Get current loop statistics.
    pub fn stats(&self) -> LoopStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
