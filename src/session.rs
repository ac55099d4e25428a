//! One cache and one request queue per signed-in session.

use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::diagnostics::{DiagnosticsSink, TracingSink};
use crate::queue::RequestQueue;
use crate::resource::{Lazy, Resource};
use crate::retry::TimeoutRetry;

/// Owns the shared state every resource of a session goes through.
///
/// Create one per process or tenant and pass it around as `Arc<Session>`.
/// Call [`teardown`](Self::teardown) on logout or tenant switch.
pub struct Session {
  coordinator: Coordinator,
  sink: Arc<dyn DiagnosticsSink>,
  retry: TimeoutRetry,
}

impl Session {
  pub fn new(config: &Config, sink: Arc<dyn DiagnosticsSink>) -> Arc<Self> {
    let cache = Arc::new(CacheStore::new(Arc::clone(&sink)));
    let queue = RequestQueue::from_config(&config.queue);

    Arc::new(Self {
      coordinator: Coordinator::new(cache, queue),
      sink,
      retry: TimeoutRetry::from_config(&config.retry),
    })
  }

  /// Session with default settings that logs diagnostics through `tracing`.
  pub fn with_defaults() -> Arc<Self> {
    Self::new(&Config::default(), Arc::new(TracingSink))
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    self.coordinator.cache()
  }

  pub fn queue(&self) -> &RequestQueue {
    self.coordinator.queue()
  }

  pub fn coordinator(&self) -> &Coordinator {
    &self.coordinator
  }

  pub fn sink(&self) -> &Arc<dyn DiagnosticsSink> {
    &self.sink
  }

  /// Deadline and retry settings for callers that want to wrap their fetches.
  pub fn retry(&self) -> TimeoutRetry {
    self.retry
  }

  /// Wrap `resource` in an unloaded lifecycle bound to this session.
  pub fn lazy<R: Resource>(self: &Arc<Self>, resource: R) -> Lazy<R> {
    Lazy::new(Arc::clone(self), resource)
  }

  /// Drop waiting requests and every cached value.
  ///
  /// A request that is already running still completes and may write its
  /// result into the emptied cache.
  pub fn teardown(&self) {
    let cancelled = self.queue().cancel_all();
    let entries = self.cache().len();
    self.cache().clear_all();
    info!(cancelled, entries, "session torn down");
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("coordinator", &self.coordinator)
      .field("retry", &self.retry)
      .finish_non_exhaustive()
  }
}
