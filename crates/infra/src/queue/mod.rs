//! Durable task queue.
//!
//! ## Design
//!
//! - Tasks live in a single table; every lifecycle write is one atomic statement
//! - Claiming locks exactly one eligible row (`FOR UPDATE SKIP LOCKED` on Postgres)
//! - A reaper returns tasks whose lock outlived the staleness threshold
//! - Failed attempts are retried with exponential backoff until `max_attempts`
//! - Delivery is at-least-once; handlers must tolerate re-execution
//!
//! ## Components
//!
//! - `TaskStore`: persistence contract (in-memory or Postgres)
//! - `HandlerRegistry`: task type -> handler
//! - `PollLoop`: reap, claim, dispatch, record outcome, on a fixed interval

pub mod executor;
pub mod postgres;
pub mod registry;
pub mod store;

pub use executor::{
    LoopStats, MIN_INTERVAL, PollLoop, PollLoopConfig, PollLoopHandle, ProcessedTask,
    TaskOutcome, TickReport,
};
pub use postgres::PostgresTaskStore;
pub use registry::{FnHandler, HandlerError, HandlerRegistry, RegistryError, TaskHandler, handler_fn};
pub use store::{
    InMemoryTaskStore, Pagination, QueueStats, TaskFilter, TaskStore, TaskStoreError,
    stale_lock_reason,
};
