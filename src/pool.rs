use crate::config::{DrainPolicy, TaskPoolBuilder};
use crate::cost::CostGather;
use crate::error::PoolError;
use crate::task::{Mode, TaskFn, WorkItem};
use crate::task_queue::{QueueConsumer, QueueProducer, SendError, WorkQueue};
use crate::terminal::TerminalState;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// State shared by every worker of one pool.
struct PoolShared<P, R, E> {
  pool_name: Arc<String>,
  task_fn: TaskFn<P, R, E>,
  mode: Mode<R, E>,
  loose_check: bool,
  drain_policy: DrainPolicy,
  terminal: TerminalState<E>,
}

/// A bounded worker pool for fan-out/fan-in batch work.
///
/// A fixed set of workers drains a bounded queue and runs the task callback on
/// each item. Items get a sequence number at submission (0, 1, 2, ...); in
/// collated mode the collator receives it with every outcome so the caller can
/// rebuild submission order. Workers may finish items in any order.
///
/// Failures are fail-stop: in strict mode the first failure is recorded, no
/// new item is started afterwards, and `join` reports that first error once
/// every worker has exited.
pub struct TaskPool<P: Send + 'static, R: Send + 'static, E: Send + 'static> {
  shared: Arc<PoolShared<P, R, E>>,
  producer: Mutex<Option<QueueProducer<WorkItem<P>>>>,
  workers: AsyncMutex<Vec<JoinHandle<()>>>,
  joined: AtomicBool,
  next_seq: AtomicU64,
  size: usize,
  submit_timeout: Option<Duration>,
  cost_gather: Option<Arc<dyn CostGather>>,
  tokio_handle: TokioHandle,
}

impl<P, R, E> TaskPool<P, R, E>
where
  P: Send + 'static,
  R: Send + 'static,
  E: Send + 'static,
{
  /// Starts a pool from `config`. Same as `TaskPoolBuilder::init`.
  pub fn start(config: TaskPoolBuilder<P, R, E>, tokio_handle: TokioHandle) -> Self {
    let TaskPoolBuilder {
      name,
      size,
      queue_capacity,
      submit_timeout,
      loose_check,
      drain_policy,
      cost_gather,
      task_fn,
      mode,
    } = config;

    if let Some(gather) = &cost_gather {
      gather.pause_cost_gather();
    }

    let queue_capacity = queue_capacity.unwrap_or(size);
    let (producer, consumer) = WorkQueue::new(queue_capacity).split();

    let shared = Arc::new(PoolShared {
      pool_name: Arc::new(name),
      task_fn,
      mode,
      loose_check,
      drain_policy,
      terminal: TerminalState::new(),
    });

    info!(
      pool_name = %*shared.pool_name,
      size,
      queue_capacity,
      ?submit_timeout,
      loose_check,
      ?drain_policy,
      mode = shared.mode.name(),
      "Starting task pool workers."
    );

    let workers = (0..size)
      .map(|worker_id| {
        let worker_shared = shared.clone();
        let worker_consumer = consumer.clone();
        tokio_handle.spawn(
          Self::run_worker_loop(worker_id, worker_shared, worker_consumer).instrument(info_span!(
            "task_pool_worker",
            pool_name = %*shared.pool_name,
            worker_id
          )),
        )
      })
      .collect();

    Self {
      shared,
      producer: Mutex::new(Some(producer)),
      workers: AsyncMutex::new(workers),
      joined: AtomicBool::new(false),
      next_seq: AtomicU64::new(0),
      size,
      submit_timeout,
      cost_gather,
      tokio_handle,
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  /// Number of workers.
  pub fn size(&self) -> usize {
    self.size
  }

  /// Returns the number of items waiting in the queue.
  pub fn queued_item_count(&self) -> usize {
    self.producer.lock().as_ref().map_or(0, |p| p.len())
  }

  /// Sequence numbers handed out so far, including submissions that timed out.
  pub fn submitted_count(&self) -> u64 {
    self.next_seq.load(AtomicOrdering::Acquire)
  }

  pub fn is_collated(&self) -> bool {
    matches!(self.shared.mode, Mode::Collated(_))
  }

  /// Returns `true` once a strict-mode failure or `abort` stopped the pool.
  pub fn is_stopped(&self) -> bool {
    self.shared.terminal.is_stopped()
  }

  /// Token cancelled when the pool stops. Long-running callbacks can watch it
  /// to give up early; the pool itself never interrupts a running callback.
  pub fn stop_token(&self) -> CancellationToken {
    self.shared.terminal.stop_token().clone()
  }

  /// Submits `payload` as the next work item.
  ///
  /// Waits while the queue is full. With a submit timeout configured, a wait
  /// longer than the timeout returns `PoolError::EnqueueTimedOut` and records
  /// the same error for `join`. Callback failures are never reported here.
  pub async fn process(&self, payload: P) -> Result<(), PoolError<E>> {
    let producer = self.producer.lock().clone();
    let producer = match producer {
      Some(p) => p,
      None => {
        warn!(pool_name = %*self.shared.pool_name, "Process: Attempted to submit to a pool that was already joined.");
        return Err(PoolError::PoolJoined);
      }
    };

    if producer.is_closed() {
      debug!(pool_name = %*self.shared.pool_name, "Process: Queue already closed by stopped workers.");
      return Err(PoolError::PoolStopped);
    }

    let seq = self.next_seq.fetch_add(1, AtomicOrdering::AcqRel);
    trace!(pool_name = %*self.shared.pool_name, seq, "Submitting item to queue.");

    match producer.send(WorkItem { seq, payload }, self.submit_timeout).await {
      Ok(()) => Ok(()),
      Err(SendError::TimedOut) => {
        let limit = self.submit_timeout.unwrap_or_default();
        warn!(pool_name = %*self.shared.pool_name, seq, ?limit, "Process: Queue stayed full past the submit timeout.");
        self.shared.terminal.record(PoolError::EnqueueTimedOut(limit));
        Err(PoolError::EnqueueTimedOut(limit))
      }
      Err(SendError::Closed) => {
        debug!(pool_name = %*self.shared.pool_name, seq, "Process: Queue closed by stopped workers.");
        Err(PoolError::PoolStopped)
      }
    }
  }

  /// Cooperative abort. Records `PoolError::Aborted` unless an error is
  /// already recorded and stops the pool; running callbacks finish normally.
  pub fn abort(&self) {
    if self.shared.terminal.fail(PoolError::Aborted) {
      info!(pool_name = %*self.shared.pool_name, "Pool aborted.");
    } else {
      debug!(pool_name = %*self.shared.pool_name, "Abort requested on a pool that already has a terminal error.");
    }
  }

  /// Closes the queue, waits for every worker to exit and returns the
  /// terminal error, if any.
  ///
  /// Cancel-safe: if the returned future is dropped before it completes,
  /// workers not yet awaited stay tracked and the next call picks up where it
  /// left off. Once a call completes, later calls return `PoolError::PoolJoined`.
  pub async fn join(&self) -> Result<(), PoolError<E>> {
    // Submissions still in flight hold their own producer clones; the queue
    // closes for workers once they finish.
    if self.producer.lock().take().is_some() {
      info!(pool_name = %*self.shared.pool_name, "Queue closed, waiting for workers to drain.");
    }

    let mut workers = self.workers.lock().await;
    if self.joined.load(AtomicOrdering::Acquire) {
      warn!(pool_name = %*self.shared.pool_name, "Join: Pool was already joined.");
      return Err(PoolError::PoolJoined);
    }

    while let Some(handle) = workers.last_mut() {
      let outcome = handle.await;
      workers.pop();
      if let Err(join_error) = outcome {
        error!(pool_name = %*self.shared.pool_name, remaining = workers.len(), "Error joining worker: {:?}", join_error);
      }
    }

    if let Some(gather) = &self.cost_gather {
      gather.resume_cost_gather();
    }
    self.joined.store(true, AtomicOrdering::Release);

    match self.shared.terminal.take_error() {
      Some(err) => {
        info!(pool_name = %*self.shared.pool_name, "All workers exited, pool failed.");
        Err(err)
      }
      None => {
        info!(pool_name = %*self.shared.pool_name, "All workers exited, pool succeeded.");
        Ok(())
      }
    }
  }

  async fn run_worker_loop(worker_id: usize, shared: Arc<PoolShared<P, R, E>>, consumer: QueueConsumer<WorkItem<P>>) {
    debug!(worker_id, "Worker loop started.");
    let mut executed: u64 = 0;
    let mut discarded: u64 = 0;

    loop {
      let next = match shared.drain_policy {
        DrainPolicy::Discard => consumer.recv().await,
        DrainPolicy::Abandon => {
          tokio::select! {
            biased;
            _ = shared.terminal.stop_token().cancelled() => None,
            item = consumer.recv() => item,
          }
        }
      };

      let item = match next {
        Some(item) => item,
        None => break,
      };

      if shared.terminal.is_stopped() {
        match shared.drain_policy {
          DrainPolicy::Discard => {
            trace!(worker_id, seq = item.seq, "Pool stopped, discarding dequeued item.");
            discarded += 1;
            continue;
          }
          DrainPolicy::Abandon => {
            trace!(worker_id, seq = item.seq, "Pool stopped, abandoning queue.");
            discarded += 1;
            break;
          }
        }
      }

      let seq = item.seq;
      executed += 1;
      if let Some(failure) = shared.execute(item).await {
        shared.on_failure(worker_id, seq, failure);
      }
    }

    if shared.drain_policy == DrainPolicy::Abandon && shared.terminal.is_stopped() {
      consumer.close().await;
    }

    debug!(worker_id, executed, discarded, "Worker loop stopped.");
  }
}

impl<P, R, E> PoolShared<P, R, E>
where
  P: Send + 'static,
  R: Send + 'static,
  E: Send + 'static,
{
  /// Runs the callback for one item and, in collated mode, the collator.
  /// Returns the item's failure, if any.
  async fn execute(&self, item: WorkItem<P>) -> Option<PoolError<E>> {
    let WorkItem { seq, payload } = item;
    let task_fn = self.task_fn.clone();

    let result = match AssertUnwindSafe(async move { (*task_fn)(payload).await }).catch_unwind().await {
      Ok(result) => result,
      Err(_panic_payload) => {
        error!(seq, "Task callback panicked.");
        return Some(PoolError::TaskPanicked(seq));
      }
    };

    match &self.mode {
      Mode::FireAndForget => result.err().map(PoolError::Task),
      Mode::Collated(collator) => {
        let mut guard = collator.lock();
        let collate = &mut *guard;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || collate(seq, result)));
        drop(guard);

        match outcome {
          Ok(Ok(())) => None,
          Ok(Err(e)) => Some(PoolError::Task(e)),
          Err(_panic_payload) => {
            error!(seq, "Collator panicked.");
            Some(PoolError::CollatorPanicked(seq))
          }
        }
      }
    }
  }

  fn on_failure(&self, worker_id: usize, seq: u64, failure: PoolError<E>) {
    if self.loose_check {
      debug!(worker_id, seq, "Item failed, ignored in loose mode.");
      return;
    }
    if self.terminal.fail(failure) {
      warn!(worker_id, seq, "Item failed, stopping pool.");
    } else {
      debug!(worker_id, seq, "Item failed after the pool already stopped.");
    }
  }
}

impl<P: Send + 'static, R: Send + 'static, E: Send + 'static> fmt::Debug for TaskPool<P, R, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskPool")
      .field("pool_name", &*self.shared.pool_name)
      .field("size", &self.size)
      .field("submit_timeout", &self.submit_timeout)
      .field("mode", &self.shared.mode)
      .field("submitted", &self.next_seq.load(AtomicOrdering::Relaxed))
      .field("stopped", &self.shared.terminal.is_stopped())
      .field("failed", &self.shared.terminal.has_error())
      .field("joined", &self.joined.load(AtomicOrdering::Relaxed))
      .finish()
  }
}

impl<P: Send + 'static, R: Send + 'static, E: Send + 'static> Drop for TaskPool<P, R, E> {
  /// Dropping an un-joined pool stops the workers and closes the queue
  /// without waiting. Cost gathering stays paused until the detached workers
  /// have exited.
  fn drop(&mut self) {
    if *self.joined.get_mut() {
      trace!(pool_name = %*self.shared.pool_name, "Drop: Pool already joined.");
      return;
    }

    // Not joined: stop the workers so they discard what is left instead of
    // running it detached, and close the queue.
    info!(
      pool_name = %*self.shared.pool_name,
      "TaskPool dropped without join. Stopping workers and closing the queue."
    );
    self.producer.get_mut().take();
    self.shared.terminal.stop_token().cancel();

    let workers = std::mem::take(self.workers.get_mut());
    if let Some(gather) = self.cost_gather.take() {
      let pool_name = self.shared.pool_name.clone();
      self.tokio_handle.spawn(async move {
        for handle in workers {
          let _ = handle.await;
        }
        debug!(pool_name = %*pool_name, "Detached workers exited, resuming cost gathering.");
        gather.resume_cost_gather();
      });
    }
  }
}
