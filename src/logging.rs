//! Subscriber setup for the `tracing` events emitted by the core.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` takes priority over `config.level`. When a log file is
/// configured the returned guard must be kept alive to flush writes.
/// Calling this a second time returns `Error::Logging`.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => level_filter(&config.level)?,
  };

  match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path.file_name().ok_or_else(|| {
        Error::Logging(format!("Log path has no file name: {}", path.display()))
      })?;

      std::fs::create_dir_all(dir)
        .map_err(|e| Error::Logging(format!("Failed to create log directory: {}", e)))?;

      let appender = tracing_appender::rolling::daily(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

      Ok(None)
    }
  }
}

fn level_filter(level: &str) -> Result<EnvFilter> {
  EnvFilter::try_new(level)
    .map_err(|e| Error::Logging(format!("Invalid log level {:?}: {}", level, e)))
}
