use std::time::Duration;

use thiserror::Error;

/// Errors that can occur within a `batch_pool` task pool.
///
/// `E` is the caller's own error type, returned by the task callback or the
/// collator. Callback and collator failures share the `Task` variant; callers
/// needing to tell them apart must encode that into `E`.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError<E> {
  #[error("Timed out adding item to the pool queue after {0:?}")]
  EnqueueTimedOut(Duration),

  #[error("Task failed: {0}")]
  Task(E),

  #[error("Task callback panicked while processing sequence {0}")]
  TaskPanicked(u64),

  #[error("Collator panicked while handling sequence {0}")]
  CollatorPanicked(u64),

  #[error("Pool was aborted")]
  Aborted,

  #[error("Pool has already been joined, cannot accept new items")]
  PoolJoined,

  #[error("Pool stopped after a failure and abandoned its queue")]
  PoolStopped,
}

impl<E> PoolError<E> {
  /// Returns the caller's error if this is a `Task` failure.
  pub fn into_task_error(self) -> Option<E> {
    match self {
      PoolError::Task(e) => Some(e),
      _ => None,
    }
  }

  /// Returns `true` for the submit-side timeout error.
  pub fn is_timeout(&self) -> bool {
    matches!(self, PoolError::EnqueueTimedOut(_))
  }
}
