use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

/// The future produced by the per-item task callback.
/// It must be `Send` and `'static`, and resolve to `Result<R, E>`.
pub type TaskFuture<R, E> = Pin<Box<dyn Future<Output = Result<R, E>> + Send + 'static>>;

/// Type-erased per-item callback shared by all workers.
pub(crate) type TaskFn<P, R, E> = Arc<dyn Fn(P) -> TaskFuture<R, E> + Send + Sync + 'static>;

/// Type-erased collator. Receives `(sequence, callback outcome)` and decides
/// whether the item counts as a failure.
pub(crate) type CollatorFn<R, E> = Box<dyn FnMut(u64, Result<R, E>) -> Result<(), E> + Send + 'static>;

/// One unit of submitted work.
pub(crate) struct WorkItem<P> {
  pub(crate) seq: u64,
  pub(crate) payload: P,
}

impl<P> fmt::Debug for WorkItem<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkItem").field("seq", &self.seq).finish_non_exhaustive()
  }
}

/// How callback outcomes are consumed, fixed at configuration time.
pub(crate) enum Mode<R, E> {
  /// Outcomes are inspected for failure and then dropped.
  FireAndForget,
  /// Every outcome goes through the collator, one invocation at a time.
  Collated(Mutex<CollatorFn<R, E>>),
}

impl<R, E> Mode<R, E> {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      Mode::FireAndForget => "fire_and_forget",
      Mode::Collated(_) => "collated",
    }
  }
}

impl<R, E> fmt::Debug for Mode<R, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}
