//! Diagnostics records emitted by the core.
//!
//! The sink is fire-and-forget: reporting never fails and never throws back
//! into the component that reported.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Info,
  Warning,
  Error,
}

/// Kind of diagnostic, the `type` field of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
  CacheInvalidation,
  UnloadedAccess,
}

/// A structured diagnostic record.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
  pub component: String,
  pub message: String,
  #[serde(rename = "type")]
  pub kind: DiagnosticKind,
  /// Who is reporting, e.g. "cache" or "resource"
  pub role: &'static str,
  pub severity: Severity,
  pub data: Value,
}

pub trait DiagnosticsSink: Send + Sync {
  fn report(&self, diagnostic: Diagnostic);
}

/// Default sink: forwards records to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
  fn report(&self, d: Diagnostic) {
    match d.severity {
      Severity::Info => tracing::info!(
        component = %d.component,
        kind = ?d.kind,
        role = d.role,
        data = %d.data,
        "{}",
        d.message
      ),
      Severity::Warning => tracing::warn!(
        component = %d.component,
        kind = ?d.kind,
        role = d.role,
        data = %d.data,
        "{}",
        d.message
      ),
      Severity::Error => tracing::error!(
        component = %d.component,
        kind = ?d.kind,
        role = d.role,
        data = %d.data,
        "{}",
        d.message
      ),
    }
  }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
  records: Arc<Mutex<Vec<Diagnostic>>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn records(&self) -> Vec<Diagnostic> {
    self.records.lock().clone()
  }

  pub fn count(&self, kind: DiagnosticKind) -> usize {
    self.records.lock().iter().filter(|d| d.kind == kind).count()
  }

  pub fn clear(&self) {
    self.records.lock().clear();
  }
}

impl DiagnosticsSink for MemorySink {
  fn report(&self, diagnostic: Diagnostic) {
    self.records.lock().push(diagnostic);
  }
}
