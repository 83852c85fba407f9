use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tracing::warn;

use crate::cost::CostGather;
use crate::pool::TaskPool;
use crate::task::{Mode, TaskFn, TaskFuture};

/// Worker count used when `size` is never set.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// What workers do with queued items once the pool has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
  /// Workers keep dequeuing and drop every remaining item unexecuted until
  /// the queue is closed by `join`. Producers never stay blocked on a full queue.
  #[default]
  Discard,
  /// Workers close the queue and exit. Buffered items are dropped, and
  /// pending or later submissions fail with `PoolError::PoolStopped`.
  Abandon,
}

/// Configuration for a `TaskPool`. Consumed by `init`, so nothing can change
/// once the workers are running.
pub struct TaskPoolBuilder<P, R, E> {
  pub(crate) name: String,
  pub(crate) size: usize,
  pub(crate) queue_capacity: Option<usize>,
  pub(crate) submit_timeout: Option<Duration>,
  pub(crate) loose_check: bool,
  pub(crate) drain_policy: DrainPolicy,
  pub(crate) cost_gather: Option<Arc<dyn CostGather>>,
  pub(crate) task_fn: TaskFn<P, R, E>,
  pub(crate) mode: Mode<R, E>,
}

impl<P, R, E> TaskPoolBuilder<P, R, E>
where
  P: Send + 'static,
  R: Send + 'static,
  E: Send + 'static,
{
  /// Starts a configuration with the required per-item callback.
  pub fn new<F, Fut>(name: &str, callback: F) -> Self
  where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    let task_fn: TaskFn<P, R, E> = Arc::new(move |payload: P| -> TaskFuture<R, E> { Box::pin(callback(payload)) });
    Self {
      name: name.to_string(),
      size: DEFAULT_POOL_SIZE,
      queue_capacity: None,
      submit_timeout: None,
      loose_check: false,
      drain_policy: DrainPolicy::default(),
      cost_gather: None,
      task_fn,
      mode: Mode::FireAndForget,
    }
  }

  /// Number of workers. Zero is raised to one.
  pub fn size(mut self, size: usize) -> Self {
    if size == 0 {
      warn!(pool_name = %self.name, "Pool size 0 requested, using 1.");
    }
    self.size = size.max(1);
    self
  }

  /// Queue capacity. Defaults to the worker count. Zero is raised to one.
  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    if capacity == 0 {
      warn!(pool_name = %self.name, "Queue capacity 0 requested, using 1.");
    }
    self.queue_capacity = Some(capacity.max(1));
    self
  }

  /// Submit timeout in milliseconds. `0` blocks indefinitely.
  pub fn submit_timeout_ms(self, timeout_ms: u64) -> Self {
    if timeout_ms == 0 {
      self.submit_timeout(None)
    } else {
      self.submit_timeout(Some(Duration::from_millis(timeout_ms)))
    }
  }

  pub fn submit_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.submit_timeout = timeout.filter(|t| !t.is_zero());
    self
  }

  /// In loose mode per-item and collation failures never fail the pool.
  pub fn loose_check(mut self, loose: bool) -> Self {
    self.loose_check = loose;
    self
  }

  pub fn drain_policy(mut self, policy: DrainPolicy) -> Self {
    self.drain_policy = policy;
    self
  }

  /// Switch paused by `init` and resumed by `join`.
  pub fn cost_gather(mut self, gather: Arc<dyn CostGather>) -> Self {
    self.cost_gather = Some(gather);
    self
  }

  /// Routes every callback outcome through `collator`, together with the
  /// item's sequence number. At most one collator call runs at a time, so the
  /// collator may freely mutate whatever it owns. An `Err` from the collator
  /// counts as an item failure.
  pub fn collate<C>(mut self, collator: C) -> Self
  where
    C: FnMut(u64, Result<R, E>) -> Result<(), E> + Send + 'static,
  {
    self.mode = Mode::Collated(Mutex::new(Box::new(collator)));
    self
  }

  /// Starts the workers on `tokio_handle` and returns the running pool.
  pub fn init(self, tokio_handle: TokioHandle) -> TaskPool<P, R, E> {
    TaskPool::start(self, tokio_handle)
  }
}

impl<P, R, E> fmt::Debug for TaskPoolBuilder<P, R, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskPoolBuilder")
      .field("name", &self.name)
      .field("size", &self.size)
      .field("queue_capacity", &self.queue_capacity)
      .field("submit_timeout", &self.submit_timeout)
      .field("loose_check", &self.loose_check)
      .field("drain_policy", &self.drain_policy)
      .field("has_cost_gather", &self.cost_gather.is_some())
      .field("mode", &self.mode)
      .finish()
  }
}
