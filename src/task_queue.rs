use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Why an item could not be placed into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendError {
  /// The queue stayed full for the whole submit window.
  TimedOut,
  /// The consumer side closed the queue.
  Closed,
}

/// A bounded, multi-producer, multi-consumer work queue.
///
/// Built on a bounded `tokio::sync::mpsc` channel. The single receiver is
/// shared by every consumer behind an async mutex, so exactly one consumer
/// waits on the channel at a time and each item is delivered once.
pub(crate) struct WorkQueue<T: Send + 'static> {
  tx: mpsc::Sender<T>,
  rx: mpsc::Receiver<T>,
}

impl<T: Send + 'static> WorkQueue<T> {
  /// Creates a new queue holding at most `capacity` buffered items.
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    Self { tx, rx }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<T>, QueueConsumer<T>) {
    (
      QueueProducer { tx: self.tx },
      QueueConsumer {
        rx: Arc::new(AsyncMutex::new(self.rx)),
      },
    )
  }
}

/// The producer handle. Cloned once per in-flight submission; the queue is
/// closed for consumers once every clone is dropped.
pub(crate) struct QueueProducer<T: Send + 'static> {
  tx: mpsc::Sender<T>,
}

/// The consumer handle, cloned into every worker.
pub(crate) struct QueueConsumer<T: Send + 'static> {
  rx: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

// Manual impls: a derive would demand `T: Clone`.
impl<T: Send + 'static> Clone for QueueProducer<T> {
  fn clone(&self) -> Self {
    Self { tx: self.tx.clone() }
  }
}

impl<T: Send + 'static> Clone for QueueConsumer<T> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}

impl<T: Send + 'static> fmt::Debug for QueueProducer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("capacity", &self.tx.max_capacity())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> fmt::Debug for QueueConsumer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer").finish_non_exhaustive()
  }
}

impl<T: Send + 'static> QueueProducer<T> {
  /// Sends an item into the queue, waiting while it is full.
  ///
  /// With `timeout` set, the wait races a timer of that length and the item
  /// is dropped if the timer wins.
  pub(crate) async fn send(&self, item: T, timeout: Option<Duration>) -> Result<(), SendError> {
    match timeout {
      None => self.tx.send(item).await.map_err(|_| SendError::Closed),
      Some(limit) => match tokio::time::timeout(limit, self.tx.send(item)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(SendError::Closed),
        Err(_) => Err(SendError::TimedOut),
      },
    }
  }

  /// Returns `true` once the consumer side has closed the queue.
  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Returns the number of items currently buffered.
  pub(crate) fn len(&self) -> usize {
    self.tx.max_capacity() - self.tx.capacity()
  }
}

impl<T: Send + 'static> QueueConsumer<T> {
  /// Receives the next item. Returns `None` only when the queue is closed
  /// and fully drained.
  pub(crate) async fn recv(&self) -> Option<T> {
    let mut rx = self.rx.lock().await;
    rx.recv().await
  }

  /// Refuses any further sends. Items already buffered stay readable, and
  /// producers blocked on a full queue are released with `SendError::Closed`.
  pub(crate) async fn close(&self) {
    self.rx.lock().await.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn test_queue_send_recv() {
    let (producer, consumer) = WorkQueue::<u64>::new(5).split();

    producer.send(1, None).await.unwrap();
    producer.send(2, None).await.unwrap();
    assert_eq!(producer.len(), 2);

    assert_eq!(consumer.recv().await, Some(1));
    assert_eq!(consumer.recv().await, Some(2));
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_queue_capacity_blocks_send() {
    let (producer, consumer) = WorkQueue::<u64>::new(1).split();

    producer.send(1, None).await.unwrap();

    let send_future = producer.send(2, None);
    tokio::pin!(send_future);

    tokio::select! {
        _ = &mut send_future => {
            panic!("Send should have blocked because the queue is full.");
        },
        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }
    assert_eq!(producer.len(), 1);

    assert_eq!(consumer.recv().await, Some(1));

    tokio::time::timeout(Duration::from_millis(50), send_future)
      .await
      .expect("Send did not complete after queue was drained.")
      .unwrap();
    assert_eq!(producer.len(), 1);
  }

  #[tokio::test]
  async fn test_send_times_out_when_full() {
    let (producer, _consumer) = WorkQueue::<u64>::new(1).split();

    producer.send(1, Some(Duration::from_millis(20))).await.unwrap();
    let result = producer.send(2, Some(Duration::from_millis(20))).await;
    assert_eq!(result, Err(SendError::TimedOut));
    assert_eq!(producer.len(), 1);
  }

  #[tokio::test]
  async fn test_consumer_close_rejects_sends_but_keeps_buffer() {
    let (producer, consumer) = WorkQueue::<u64>::new(2).split();

    producer.send(7, None).await.unwrap();
    consumer.close().await;

    assert!(producer.is_closed());
    assert_eq!(producer.send(8, None).await, Err(SendError::Closed));
    assert_eq!(consumer.recv().await, Some(7));
    assert_eq!(consumer.recv().await, None);
  }

  #[tokio::test]
  async fn test_close_releases_blocked_producer() {
    let (producer, consumer) = WorkQueue::<u64>::new(1).split();
    producer.send(1, None).await.unwrap();

    let blocked = {
      let producer = producer.clone();
      tokio::spawn(async move { producer.send(2, None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    consumer.close().await;

    let result = tokio::time::timeout(Duration::from_millis(200), blocked)
      .await
      .expect("Blocked producer was not released by close.")
      .unwrap();
    assert_eq!(result, Err(SendError::Closed));
  }

  #[tokio::test]
  async fn test_dropping_producers_ends_consumer_after_drain() {
    let (producer, consumer) = WorkQueue::<u64>::new(2).split();

    producer.send(1, None).await.unwrap();
    drop(producer);

    assert_eq!(consumer.recv().await, Some(1));
    assert_eq!(consumer.recv().await, None);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_queue_many_producers_many_consumers() {
    let (producer, consumer) = WorkQueue::<u64>::new(4).split();
    let num_items: u64 = 40;
    let received_count = Arc::new(AtomicUsize::new(0));

    let mut consumers = Vec::new();
    for _ in 0..3 {
      let consumer = consumer.clone();
      let received_count = received_count.clone();
      consumers.push(tokio::spawn(async move {
        while consumer.recv().await.is_some() {
          received_count.fetch_add(1, Ordering::SeqCst);
        }
      }));
    }
    drop(consumer);

    let mut producers = Vec::new();
    for i in 0..num_items {
      let p = producer.clone();
      producers.push(tokio::spawn(async move {
        p.send(i, None).await.unwrap();
      }));
    }
    drop(producer);

    for handle in producers {
      handle.await.unwrap();
    }
    for handle in consumers {
      handle.await.unwrap();
    }

    assert_eq!(received_count.load(Ordering::SeqCst), num_items as usize);
  }
}
