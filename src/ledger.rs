//! Bounded per-key log buffers with live subscriber fan-out.
//!
//! One lock guards both the lines and the subscriber set of a ledger, so a
//! subscriber's backlog snapshot and its registration happen atomically with
//! respect to appends: no line is both replayed and delivered live, and none
//! falls between the two.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::LogLine;

pub const LOG_CAPACITY: usize = 200;
pub const SUBSCRIBER_INBOX: usize = 16;

#[derive(Default)]
struct Log {
  lines: VecDeque<LogLine>,
  subscribers: HashMap<u64, mpsc::Sender<LogLine>>,
}

struct Inner {
  logs: RwLock<HashMap<String, Log>>,
  next_subscriber: AtomicU64,
  capacity: usize,
  inbox: usize,
}

#[derive(Clone)]
pub struct LogLedger {
  inner: Arc<Inner>,
}

impl Default for LogLedger {
  fn default() -> Self {
    Self::new()
  }
}

impl LogLedger {
  pub fn new() -> Self {
    Self::with_limits(LOG_CAPACITY, SUBSCRIBER_INBOX)
  }

  pub fn with_limits(capacity: usize, inbox: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        logs: RwLock::new(HashMap::new()),
        next_subscriber: AtomicU64::new(1),
        capacity: capacity.max(1),
        inbox: inbox.max(1),
      }),
    }
  }

  /// Appends a line and offers it to every live subscriber of `key`.
  /// Full or closed inboxes drop the line for that subscriber only.
  pub fn append(&self, key: &str, text: impl Into<String>) -> LogLine {
    let line = LogLine::new(text);
    let mut logs = self.inner.logs.write();
    let log = logs.entry(key.to_string()).or_default();
    while log.lines.len() >= self.inner.capacity {
      log.lines.pop_front();
    }
    log.lines.push_back(line.clone());
    for (id, tx) in &log.subscribers {
      if tx.try_send(line.clone()).is_err() {
        debug!(key, subscriber = id, "subscriber inbox full or closed, dropping line");
      }
    }
    line
  }

  pub fn lines(&self, key: &str) -> Vec<LogLine> {
    self
      .inner
      .logs
      .read()
      .get(key)
      .map(|log| log.lines.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn subscribe(&self, key: &str) -> Subscription {
    let (tx, rx) = mpsc::channel(self.inner.inbox);
    let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
    let backlog = {
      let mut logs = self.inner.logs.write();
      let log = logs.entry(key.to_string()).or_default();
      log.subscribers.insert(id, tx);
      log.lines.iter().cloned().collect()
    };
    Subscription {
      key: key.to_string(),
      id,
      backlog,
      rx,
      ledger: self.clone(),
    }
  }

  /// Safe to call any number of times for the same subscription.
  pub fn unsubscribe(&self, key: &str, id: u64) {
    let mut logs = self.inner.logs.write();
    if let Some(log) = logs.get_mut(key) {
      log.subscribers.remove(&id);
      if log.subscribers.is_empty() && log.lines.is_empty() {
        logs.remove(key);
      }
    }
  }

  pub fn subscriber_count(&self, key: &str) -> usize {
    self.inner.logs.read().get(key).map(|log| log.subscribers.len()).unwrap_or(0)
  }
}

/// A live feed of lines appended to one key. Dropping it unsubscribes.
pub struct Subscription {
  key: String,
  id: u64,
  backlog: Vec<LogLine>,
  rx: mpsc::Receiver<LogLine>,
  ledger: LogLedger,
}

impl Subscription {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Lines already present when the subscription was taken.
  pub fn take_backlog(&mut self) -> Vec<LogLine> {
    std::mem::take(&mut self.backlog)
  }

  pub async fn recv(&mut self) -> Option<LogLine> {
    self.rx.recv().await
  }
}

impl Stream for Subscription {
  type Item = LogLine;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.get_mut().rx.poll_recv(cx)
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.ledger.unsubscribe(&self.key, self.id);
  }
}
