//! Cost gathering: per-call timing notices that a pool pauses while its
//! workers run concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

/// A switch the pool flips around its concurrent phase.
///
/// `init` calls `pause_cost_gather` before starting workers and `join` calls
/// `resume_cost_gather` once every worker has exited.
pub trait CostGather: Send + Sync {
  fn pause_cost_gather(&self);
  fn resume_cost_gather(&self);
}

/// Collects `name=<elapsed>ms` notices for timed sections of a request.
#[derive(Debug, Default)]
pub struct CostTracker {
  paused: AtomicBool,
  notices: Mutex<Vec<(String, String)>>,
}

impl CostTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::Acquire)
  }

  /// Starts timing a section called `name`.
  pub fn start(&self, name: &str) -> CostSpan<'_> {
    CostSpan {
      tracker: self,
      name: name.to_string(),
      started: Instant::now(),
    }
  }

  /// Adds a free-form notice.
  pub fn push_notice(&self, key: &str, value: impl Into<String>) {
    let value = value.into();
    trace!(key, value = %value, "Cost notice recorded.");
    self.notices.lock().push((key.to_string(), value));
  }

  /// Notices recorded so far, in insertion order.
  pub fn notices(&self) -> Vec<(String, String)> {
    self.notices.lock().clone()
  }
}

impl CostGather for CostTracker {
  fn pause_cost_gather(&self) {
    debug!("Cost gathering paused.");
    self.paused.store(true, Ordering::Release);
  }

  fn resume_cost_gather(&self) {
    debug!("Cost gathering resumed.");
    self.paused.store(false, Ordering::Release);
  }
}

/// A running timed section. Consumed by `finish`.
#[derive(Debug)]
pub struct CostSpan<'a> {
  tracker: &'a CostTracker,
  name: String,
  started: Instant,
}

impl CostSpan<'_> {
  /// Returns the elapsed milliseconds and records a notice for them.
  /// While gathering is paused nothing is recorded and `0` is returned.
  pub fn finish(self) -> u64 {
    if self.tracker.is_paused() {
      return 0;
    }
    let cost = self.started.elapsed().as_millis() as u64;
    self.tracker.push_notice(&self.name, format!("{}ms", cost));
    cost
  }
}
