//! Infrastructure layer: task storage (in-memory and Postgres), the claim
//! protocol, stale-lock recovery, handler dispatch and the poll loop.

pub mod clock;
pub mod config;
pub mod queue;


pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, QueueConfig};
