//! Deadline and bounded retry around a single async operation.

use color_eyre::eyre::eyre;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Runs an operation under a per-attempt deadline, retrying on failure.
///
/// A timed-out attempt is abandoned, not aborted: it keeps running as a
/// detached task and its side effects are not rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutRetry {
  timeout: Duration,
  max_retries: u32,
  backoff: Duration,
}

impl TimeoutRetry {
  /// `max_retries = 0` means exactly one attempt.
  pub fn new(timeout: Duration, max_retries: u32) -> Self {
    Self {
      timeout,
      max_retries,
      backoff: Duration::ZERO,
    }
  }

  /// Pause between attempts. Zero retries immediately.
  pub fn with_backoff(mut self, backoff: Duration) -> Self {
    self.backoff = backoff;
    self
  }

  pub fn from_config(config: &RetryConfig) -> Self {
    Self::new(Duration::from_millis(config.timeout_ms), config.max_retries)
      .with_backoff(Duration::from_millis(config.backoff_ms))
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  /// Run `op` until it succeeds or attempts are exhausted.
  ///
  /// `label` names the operation in logs and in `Error::Fetch`. The last
  /// failure is returned once `max_retries + 1` attempts have failed.
  pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let mut attempts = 0u32;

    loop {
      attempts += 1;
      let attempt = tokio::spawn(op());

      let failure = match tokio::time::timeout(self.timeout, attempt).await {
        Ok(Ok(Ok(value))) => {
          debug!(label, attempts, "operation succeeded");
          return Ok(value);
        }
        Ok(Ok(Err(report))) => Error::fetch(label, report),
        Ok(Err(join_error)) => {
          Error::fetch(label, eyre!("attempt did not complete: {}", join_error))
        }
        Err(_) => Error::DeadlineExceeded {
          attempts,
          timeout: self.timeout,
        },
      };

      if attempts > self.max_retries {
        warn!(label, attempts, error = %failure, "giving up");
        return Err(failure);
      }

      warn!(label, attempts, error = %failure, "attempt failed, retrying");
      if !self.backoff.is_zero() {
        tokio::time::sleep(self.backoff).await;
      }
    }
  }
}

impl Default for TimeoutRetry {
  fn default() -> Self {
    Self::from_config(&RetryConfig::default())
  }
}
