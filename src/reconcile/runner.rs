//! A per-key single-flight work queue.
//!
//! A key is never reconciled twice at once. Enqueues that land while a pass
//! is running collapse into one rerun, and a `RequeueAfter` result arms a
//! single timer that any newer enqueue supersedes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, warn};

use crate::cluster::crd::TaskKey;
use crate::reconcile::{Action, Reconcile};

const BACKOFF_BASE_MS: u64 = 2;
const BACKOFF_FACTOR: u64 = 250;
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Slot {
  running: bool,
  dirty: bool,
  /// Bumped on every enqueue; a timer only fires if it still matches.
  timer: u64,
  failures: usize,
}

struct Inner<R> {
  reconciler: Arc<R>,
  slots: Mutex<HashMap<TaskKey, Slot>>,
}

pub struct Runner<R> {
  inner: Arc<Inner<R>>,
}

impl<R> Clone for Runner<R> {
  fn clone(&self) -> Self {
    Self { inner: self.inner.clone() }
  }
}

/// 500ms, 1s, 2s, ... capped at a minute.
fn error_backoff(failures: usize) -> Duration {
  ExponentialBackoff::from_millis(BACKOFF_BASE_MS)
    .factor(BACKOFF_FACTOR)
    .max_delay(BACKOFF_MAX)
    .nth(failures.saturating_sub(1))
    .unwrap_or(BACKOFF_MAX)
}

impl<R: Reconcile> Runner<R> {
  pub fn new(reconciler: Arc<R>) -> Self {
    Self {
      inner: Arc::new(Inner {
        reconciler,
        slots: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Schedules a pass for `key`, now or right after the one in flight.
  pub fn enqueue(&self, key: TaskKey) {
    let start = {
      let mut slots = self.inner.slots.lock();
      let slot = slots.entry(key.clone()).or_default();
      slot.timer += 1;
      if slot.running {
        slot.dirty = true;
        false
      } else {
        slot.running = true;
        true
      }
    };
    if start {
      let runner = self.clone();
      tokio::spawn(async move { runner.run(key).await });
    }
  }

  /// Feeds change notifications into the queue until the sender is gone.
  pub fn watch(&self, mut changes: broadcast::Receiver<TaskKey>) -> JoinHandle<()> {
    let runner = self.clone();
    tokio::spawn(async move {
      loop {
        match changes.recv().await {
          Ok(key) => runner.enqueue(key),
          Err(RecvError::Lagged(missed)) => warn!(missed, "change feed lagged"),
          Err(RecvError::Closed) => break,
        }
      }
    })
  }

  async fn run(&self, key: TaskKey) {
    loop {
      let result = self.inner.reconciler.reconcile(&key).await;

      let mut slots = self.inner.slots.lock();
      let Some(slot) = slots.get_mut(&key) else {
        return;
      };
      let next = match result {
        Ok(Action::Done) => {
          slot.failures = 0;
          None
        }
        Ok(Action::RequeueAfter(after)) => {
          slot.failures = 0;
          Some(after)
        }
        Err(e) => {
          slot.failures += 1;
          let after = error_backoff(slot.failures);
          error!(task = %key, error = %e, failures = slot.failures, retry_in = ?after, "reconcile failed");
          Some(after)
        }
      };

      if slot.dirty {
        slot.dirty = false;
        continue;
      }
      slot.running = false;

      match next {
        Some(after) => {
          let generation = slot.timer;
          debug!(task = %key, after = ?after, "requeue");
          let runner = self.clone();
          let key = key.clone();
          tokio::spawn(async move {
            sleep(after).await;
            runner.fire(key, generation);
          });
        }
        None => {
          slots.remove(&key);
        }
      }
      return;
    }
  }

  fn fire(&self, key: TaskKey, generation: u64) {
    let current = self.inner.slots.lock().get(&key).map(|s| s.timer);
    if current == Some(generation) {
      self.enqueue(key);
    }
  }

  #[cfg(test)]
  fn tracked(&self) -> usize {
    self.inner.slots.lock().len()
  }
}
