use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PoolError;

/// Shared stop flag and first-error cell.
///
/// `claimed` is only written while holding the error mutex, together with the
/// value, so a reader never sees a claimed cell without its error. Readers of
/// `has_error` and the stop flag stay lock-free; the mutex is only taken when
/// an item fails and by `join`.
pub(crate) struct TerminalState<E> {
  stop: CancellationToken,
  claimed: AtomicBool,
  error: Mutex<Option<PoolError<E>>>,
}

impl<E> TerminalState<E> {
  pub(crate) fn new() -> Self {
    Self {
      stop: CancellationToken::new(),
      claimed: AtomicBool::new(false),
      error: Mutex::new(None),
    }
  }

  /// Records `err` as the terminal error unless one is already recorded.
  /// Returns `true` if this call set it.
  pub(crate) fn record(&self, err: PoolError<E>) -> bool {
    let mut slot = self.error.lock();
    if !self.claimed.load(Ordering::Acquire) {
      *slot = Some(err);
      self.claimed.store(true, Ordering::Release);
      true
    } else {
      debug!("Terminal error already recorded, dropping later error.");
      false
    }
  }

  /// Records `err` (first wins) and raises the stop flag.
  pub(crate) fn fail(&self, err: PoolError<E>) -> bool {
    let won = self.record(err);
    self.stop.cancel();
    won
  }

  pub(crate) fn is_stopped(&self) -> bool {
    self.stop.is_cancelled()
  }

  pub(crate) fn has_error(&self) -> bool {
    self.claimed.load(Ordering::Acquire)
  }

  pub(crate) fn stop_token(&self) -> &CancellationToken {
    &self.stop
  }

  /// Takes the recorded error out of the cell.
  pub(crate) fn take_error(&self) -> Option<PoolError<E>> {
    self.error.lock().take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn test_first_error_wins() {
    let state = TerminalState::<String>::new();
    assert!(state.fail(PoolError::Task("first".to_string())));
    assert!(!state.fail(PoolError::Task("second".to_string())));
    assert!(!state.record(PoolError::Aborted));

    assert!(state.is_stopped());
    assert_eq!(state.take_error(), Some(PoolError::Task("first".to_string())));
  }

  #[test]
  fn test_record_does_not_stop() {
    let state = TerminalState::<String>::new();
    assert!(state.record(PoolError::EnqueueTimedOut(Duration::from_millis(5))));
    assert!(state.has_error());
    assert!(!state.is_stopped());
  }

  #[test]
  fn test_claimed_cell_always_holds_its_error() {
    for _ in 0..200 {
      let state = Arc::new(TerminalState::<usize>::new());
      let writer = {
        let state = state.clone();
        std::thread::spawn(move || state.fail(PoolError::Aborted))
      };

      while !state.has_error() {
        std::hint::spin_loop();
      }
      assert_eq!(state.take_error(), Some(PoolError::Aborted));
      assert!(writer.join().unwrap());
    }
  }

  #[test]
  fn test_error_taken_once_is_not_replaced() {
    let state = TerminalState::<String>::new();
    assert!(state.record(PoolError::Aborted));
    assert_eq!(state.take_error(), Some(PoolError::Aborted));

    assert!(!state.record(PoolError::Task("late".to_string())));
    assert_eq!(state.take_error(), None);
  }

  #[test]
  fn test_concurrent_failures_record_exactly_one() {
    let state = Arc::new(TerminalState::<usize>::new());
    let handles: Vec<_> = (0..8)
      .map(|i| {
        let state = state.clone();
        std::thread::spawn(move || state.fail(PoolError::Task(i)))
      })
      .collect();

    let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
    assert_eq!(winners, 1);
    assert!(matches!(state.take_error(), Some(PoolError::Task(_))));
  }
}
