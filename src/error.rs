//! Error types for the cache and request coordination core.
//!
//! Cache misses are not errors: lookups return `Option`. Everything here is
//! local to one request or one resource and never poisons the shared cache or
//! the queue.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
  /// Every attempt of a timeout-wrapped operation hit its deadline or failed,
  /// and the last one was a deadline.
  #[error("Deadline of {timeout:?} exceeded after {attempts} attempt(s)")]
  DeadlineExceeded { attempts: u32, timeout: Duration },

  /// The remote fetch closure itself failed.
  #[error("Fetch failed for {key}: {source}")]
  Fetch {
    key: String,
    #[source]
    source: BoxError,
  },

  /// The remote answered, but with nothing to load.
  #[error("Remote returned no payload for {key}")]
  EmptyPayload { key: String },

  /// Loading a resource failed; it stays unloaded.
  #[error("Load of {kind} {identity} failed: {source}")]
  Load {
    kind: &'static str,
    identity: String,
    #[source]
    source: Arc<Error>,
  },

  /// A consumer touched resource data before it was loaded (harsh guard).
  #[error("{kind} {identity} is not loaded")]
  NotLoaded { kind: &'static str, identity: String },

  /// Reloading a resource failed; the previous state was put back.
  #[error("Refresh of {kind} {identity} failed (was loaded: {was_loaded}): {source}")]
  RefreshFailed {
    kind: &'static str,
    identity: String,
    was_loaded: bool,
    #[source]
    source: Arc<Error>,
  },

  #[error("Configuration error: {0}")]
  Config(String),

  #[error("Logging setup failed: {0}")]
  Logging(String),
}

impl Error {
  /// Wrap a fetch closure's report, keeping its source chain.
  pub fn fetch(key: impl Into<String>, report: color_eyre::Report) -> Self {
    Error::Fetch {
      key: key.into(),
      source: report.into(),
    }
  }

  pub fn is_deadline(&self) -> bool {
    matches!(self, Error::DeadlineExceeded { .. })
  }
}

pub type Result<T> = std::result::Result<T, Error>;
