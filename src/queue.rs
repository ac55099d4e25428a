//! Sequential, cancellable request queue.
//!
//! Work items run one at a time in submission order, each after a short
//! settle delay. This serializes outbound calls against a backend that
//! penalizes bursts. Only items that have not started can be cancelled.
//!
//! ```ignore
//! let queue = RequestQueue::new(Duration::from_millis(25));
//! let a = queue.enqueue("list_tasks", || async { client.get_list("tasks").await });
//! let b = queue.enqueue(QueueKey::Unkeyed, || async { client.whoami().await });
//! queue.cancel("list_tasks"); // false once it has started
//! let me = b.await?;
//! ```

use color_eyre::eyre::eyre;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::cache::CacheKey;
use crate::config::QueueConfig;
use crate::error::{Error, Result};

/// Dedupe and cancellation key of a queued item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
  Keyed(String),
  /// Never matches a cancellation and never touches the cache
  Unkeyed,
}

impl QueueKey {
  fn matches(&self, key: &str) -> bool {
    matches!(self, QueueKey::Keyed(k) if k == key)
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      QueueKey::Keyed(k) => Some(k),
      QueueKey::Unkeyed => None,
    }
  }
}

impl fmt::Display for QueueKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      QueueKey::Keyed(k) => f.write_str(k),
      QueueKey::Unkeyed => f.write_str("<unkeyed>"),
    }
  }
}

impl From<&str> for QueueKey {
  fn from(key: &str) -> Self {
    QueueKey::Keyed(key.to_string())
  }
}

impl From<String> for QueueKey {
  fn from(key: String) -> Self {
    QueueKey::Keyed(key)
  }
}

impl From<&CacheKey> for QueueKey {
  fn from(key: &CacheKey) -> Self {
    QueueKey::Keyed(key.build())
  }
}

impl From<CacheKey> for QueueKey {
  fn from(key: CacheKey) -> Self {
    QueueKey::from(&key)
  }
}

/// Type-erased work item. Resolves its caller's channel itself and reports
/// only whether it failed, for the queue's log.
type Job = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<(), String>> + Send>;

struct QueueItem {
  key: QueueKey,
  job: Job,
}

#[derive(Default)]
struct QueueState {
  backlog: VecDeque<QueueItem>,
  /// Key of the item that has been popped and is settling or running
  current: Option<QueueKey>,
  draining: bool,
}

struct Inner {
  state: Mutex<QueueState>,
  settle_delay: Duration,
}

/// FIFO executor with concurrency 1.
///
/// Cheap to clone; clones share the same backlog.
#[derive(Clone)]
pub struct RequestQueue {
  inner: Arc<Inner>,
}

impl RequestQueue {
  pub fn new(settle_delay: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(QueueState::default()),
        settle_delay,
      }),
    }
  }

  pub fn from_config(config: &QueueConfig) -> Self {
    Self::new(Duration::from_millis(config.settle_delay_ms))
  }

  pub fn settle_delay(&self) -> Duration {
    self.inner.settle_delay
  }

  /// Append `work` to the backlog and start draining if idle.
  ///
  /// The item is submitted when this is called, not when the returned future
  /// is first polled. If the item is cancelled before it starts, the returned
  /// future never resolves; drop it.
  ///
  /// Must be called within a Tokio runtime.
  pub fn enqueue<T, F, Fut>(&self, key: impl Into<QueueKey>, work: F) -> Pending<T>
  where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let key = key.into();
    let label = key.to_string();
    let (tx, rx) = oneshot::channel();

    let job: Job = Box::new(move || {
      async move {
        let outcome = AssertUnwindSafe(async move { work().await })
          .catch_unwind()
          .await
          .unwrap_or_else(|_| Err(eyre!("queued work panicked")));
        let failure = outcome.as_ref().err().map(|e| e.to_string());
        // The caller may have dropped its handle
        let _ = tx.send(outcome.map_err(|e| Error::fetch(label, e)));
        match failure {
          Some(message) => Err(message),
          None => Ok(()),
        }
      }
      .boxed()
    });

    let start_draining = {
      let mut state = self.inner.state.lock();
      state.backlog.push_back(QueueItem {
        key: key.clone(),
        job,
      });
      trace!(key = %key, backlog = state.backlog.len(), "enqueued");
      if state.draining {
        false
      } else {
        state.draining = true;
        true
      }
    };

    if start_draining {
      tokio::spawn(drain(Arc::clone(&self.inner)));
    }

    Pending::new(rx)
  }

  /// Remove a not-yet-started item by key.
  ///
  /// Returns false when `key` belongs to the item currently settling or
  /// running (even if another item with that key is still waiting), or when
  /// no waiting item has that key. Removes only the first match. The removed
  /// item's future is left pending, not failed.
  pub fn cancel(&self, key: &str) -> bool {
    let mut state = self.inner.state.lock();

    if state.current.as_ref().is_some_and(|c| c.matches(key)) {
      debug!(key, "cannot cancel a request that has started");
      return false;
    }

    match state.backlog.iter().position(|item| item.key.matches(key)) {
      Some(index) => {
        state.backlog.remove(index);
        debug!(key, backlog = state.backlog.len(), "cancelled queued request");
        true
      }
      None => false,
    }
  }

  /// Drop every item that has not started. Returns how many were dropped.
  pub fn cancel_all(&self) -> usize {
    let mut state = self.inner.state.lock();
    let count = state.backlog.len();
    state.backlog.clear();
    if count > 0 {
      debug!(count, "cancelled all queued requests");
    }
    count
  }

  /// Items waiting to start.
  pub fn len(&self) -> usize {
    self.inner.state.lock().backlog.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_idle(&self) -> bool {
    !self.inner.state.lock().draining
  }

  pub fn current_key(&self) -> Option<QueueKey> {
    self.inner.state.lock().current.clone()
  }
}

impl Default for RequestQueue {
  fn default() -> Self {
    Self::from_config(&QueueConfig::default())
  }
}

impl fmt::Debug for RequestQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("RequestQueue")
      .field("settle_delay", &self.inner.settle_delay)
      .field("backlog", &state.backlog.len())
      .field("current", &state.current)
      .field("draining", &state.draining)
      .finish()
  }
}

/// Pop and run items until the backlog is empty, then go idle.
async fn drain(inner: Arc<Inner>) {
  loop {
    let item = {
      let mut state = inner.state.lock();
      match state.backlog.pop_front() {
        Some(item) => {
          state.current = Some(item.key.clone());
          item
        }
        None => {
          state.current = None;
          state.draining = false;
          trace!("queue idle");
          return;
        }
      }
    };

    if !inner.settle_delay.is_zero() {
      tokio::time::sleep(inner.settle_delay).await;
    }

    debug!(key = %item.key, "running queued request");
    if let Err(message) = (item.job)().await {
      warn!(key = %item.key, error = %message, "queued request failed");
    }

    inner.state.lock().current = None;
  }
}

/// Result of an enqueued item.
///
/// Resolves with the work's output, or stays pending forever if the item was
/// cancelled before it started.
#[must_use = "the queued work runs regardless, but its result is lost if this is dropped"]
pub struct Pending<T> {
  rx: oneshot::Receiver<Result<T>>,
  cancelled: bool,
}

impl<T> Pending<T> {
  fn new(rx: oneshot::Receiver<Result<T>>) -> Self {
    Self {
      rx,
      cancelled: false,
    }
  }
}

impl<T> Future for Pending<T> {
  type Output = Result<T>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    if this.cancelled {
      return Poll::Pending;
    }
    match Pin::new(&mut this.rx).poll(cx) {
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      Poll::Ready(Err(_)) => {
        // Sender dropped without running: the item was cancelled
        this.cancelled = true;
        Poll::Pending
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<T> fmt::Debug for Pending<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pending")
      .field("cancelled", &self.cancelled)
      .finish_non_exhaustive()
  }
}
