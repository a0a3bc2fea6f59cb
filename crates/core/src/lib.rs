//! `taskq-core` — task queue domain building blocks.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! the task record and its lifecycle transitions, identifiers, the opaque
//! payload wrapper and the retry/backoff policy.

pub mod error;
pub mod id;
pub mod payload;
pub mod retry;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{TaskId, WorkerId};
pub use payload::Payload;
pub use retry::{BackoffStrategy, FailureDisposition, RetryPolicy};
pub use task::{
    ClaimedTask, DEFAULT_MAX_ATTEMPTS, EnqueueOptions, Task, TaskStatus, TaskType,
};
