//! A Tokio-based bounded worker pool for fan-out/fan-in batch work, with
//! sequence-numbered result collation, submit timeouts and fail-stop
//! error handling.

mod config;
mod cost;
mod error;
mod pool;
mod task;
mod task_queue;
mod terminal;

pub use config::{DrainPolicy, TaskPoolBuilder, DEFAULT_POOL_SIZE};
pub use cost::{CostGather, CostSpan, CostTracker};
pub use error::PoolError;
pub use pool::TaskPool;
pub use task::TaskFuture;
