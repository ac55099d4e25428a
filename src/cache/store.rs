//! Process-wide keyed storage of opaque values.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::CacheKey;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticsSink, Severity, TracingSink};

type Value = Arc<dyn Any + Send + Sync>;

/// A single cached value plus its bookkeeping.
struct CacheEntry {
  value: Value,
  type_name: &'static str,
  /// Successful lookups; diagnostic only
  hits: u64,
  cached_at: DateTime<Utc>,
}

/// Read-only view of an entry's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
  pub hits: u64,
  pub cached_at: DateTime<Utc>,
  pub type_name: &'static str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub total_hits: u64,
}

/// Shared cache of immutable snapshots, keyed by caller-built strings.
///
/// Values are stored behind `Arc` and handed out by reference count, so a
/// lookup returns the very object that was written. Writers never mutate a
/// cached value in place; they overwrite the key. Concurrent writes to the
/// same key are last-write-wins.
pub struct CacheStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
  sink: Arc<dyn DiagnosticsSink>,
}

impl CacheStore {
  pub fn new(sink: Arc<dyn DiagnosticsSink>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      sink,
    }
  }

  /// Look up `key`, counting a hit when it is present.
  ///
  /// An entry holding a different type than `T` is treated as a miss.
  pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
    let mut entries = self.entries.lock();
    let entry = entries.get_mut(key)?;

    match Arc::clone(&entry.value).downcast::<T>() {
      Ok(value) => {
        entry.hits += 1;
        debug!(key, hits = entry.hits, "cache hit");
        Some(value)
      }
      Err(_) => {
        warn!(
          key,
          stored = entry.type_name,
          requested = type_name::<T>(),
          "cached value has a different type, treating as miss"
        );
        None
      }
    }
  }

  /// Overwrite whatever is stored under `key`.
  ///
  /// To remember that a query resolves to nothing, cache an `Option::None`;
  /// that is a hit, distinct from having no entry.
  pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
    let key = key.into();
    debug!(key = %key, "cache set");
    self.entries.lock().insert(
      key,
      CacheEntry {
        value,
        type_name: type_name::<T>(),
        hits: 0,
        cached_at: Utc::now(),
      },
    );
  }

  /// Remove the entry for `key`. Returns whether anything was removed.
  pub fn invalidate(&self, key: &str) -> bool {
    let (before, removed, after) = {
      let mut entries = self.entries.lock();
      let before = entries.len();
      let removed = entries.remove(key).map(|e| e.hits);
      (before, removed, entries.len())
    };

    self.report_invalidation(
      format!("Invalidated {}", key),
      json!({
        "key": key,
        "removed": removed.is_some(),
        "hits": removed,
        "entries_before": before,
        "entries_after": after,
      }),
    );

    removed.is_some()
  }

  /// Remove every entry whose key starts with `prefix`. Returns the count removed.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let (before, removed) = self.remove_where(|k| k.starts_with(prefix));
    let count = removed.len();
    self.report_bulk_invalidation(
      format!("Invalidated {} entries with prefix {}", count, prefix),
      json!({ "prefix": prefix }),
      before,
      removed,
    );
    count
  }

  /// Remove the plain entry of `key`'s entity and every shaped or scoped
  /// variant of it. Returns the count removed.
  pub fn invalidate_entity(&self, key: &CacheKey) -> usize {
    let base = key.base();
    let (before, removed) = self.remove_where(|k| key.covers(k));
    let count = removed.len();
    self.report_bulk_invalidation(
      format!("Invalidated {} entries of {}", count, base),
      json!({ "entity": base }),
      before,
      removed,
    );
    count
  }

  /// Drop every entry, e.g. on session or tenant switch.
  pub fn clear_all(&self) {
    let before = {
      let mut entries = self.entries.lock();
      let before = entries.len();
      entries.clear();
      before
    };

    self.report_invalidation(
      "Cleared cache".to_string(),
      json!({ "entries_before": before, "entries_after": 0 }),
    );
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.lock().contains_key(key)
  }

  /// Hit count for `key`, without counting this call as a hit.
  pub fn hits(&self, key: &str) -> Option<u64> {
    self.entries.lock().get(key).map(|e| e.hits)
  }

  pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
    self.entries.lock().get(key).map(|e| EntryInfo {
      hits: e.hits,
      cached_at: e.cached_at,
      type_name: e.type_name,
    })
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let entries = self.entries.lock();
    CacheStats {
      entries: entries.len(),
      total_hits: entries.values().map(|e| e.hits).sum(),
    }
  }

  /// Returns (entries before, removed keys).
  fn remove_where(&self, matches: impl Fn(&str) -> bool) -> (usize, Vec<String>) {
    let mut entries = self.entries.lock();
    let before = entries.len();
    let removed: Vec<String> = entries
      .keys()
      .filter(|k| matches(k.as_str()))
      .cloned()
      .collect();
    for key in &removed {
      entries.remove(key);
    }
    (before, removed)
  }

  fn report_bulk_invalidation(
    &self,
    message: String,
    mut data: serde_json::Value,
    before: usize,
    removed: Vec<String>,
  ) {
    data["entries_before"] = json!(before);
    data["entries_after"] = json!(before - removed.len());
    data["keys"] = json!(removed);
    self.report_invalidation(message, data);
  }

  fn report_invalidation(&self, message: String, data: serde_json::Value) {
    self.sink.report(Diagnostic {
      component: "CacheStore".to_string(),
      message,
      kind: DiagnosticKind::CacheInvalidation,
      role: "cache",
      severity: Severity::Info,
      data,
    });
  }
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(Arc::new(TracingSink))
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, EntityKind};
  use crate::diagnostics::MemorySink;

  #[derive(Debug, PartialEq)]
  struct User {
    id: u32,
    name: String,
  }

  fn store() -> (CacheStore, MemorySink) {
    let sink = MemorySink::new();
    (CacheStore::new(Arc::new(sink.clone())), sink)
  }

  #[test]
  fn test_set_then_get_returns_same_object() {
    let (cache, _) = store();
    let ada = Arc::new(User {
      id: 42,
      name: "Ada".to_string(),
    });
    cache.set("user_42", Arc::clone(&ada));

    let hit = cache.get::<User>("user_42").unwrap();
    assert!(Arc::ptr_eq(&hit, &ada));
  }

  #[test]
  fn test_missing_key_is_none() {
    let (cache, _) = store();
    assert!(cache.get::<User>("user_1").is_none());
    assert!(!cache.invalidate("user_1"));
  }

  #[test]
  fn test_hits_count_successful_lookups_only() {
    let (cache, _) = store();
    cache.set("n", Arc::new(7u32));
    cache.get::<u32>("n");
    cache.get::<u32>("n");
    cache.get::<String>("n");
    cache.get::<u32>("missing");

    assert_eq!(cache.hits("n"), Some(2));
    assert_eq!(cache.stats().total_hits, 2);
  }

  #[test]
  fn test_type_mismatch_is_a_miss() {
    let (cache, _) = store();
    cache.set("n", Arc::new(7u32));
    assert!(cache.get::<u64>("n").is_none());
    assert_eq!(cache.entry_info("n").unwrap().type_name, "u32");
  }

  #[test]
  fn test_cached_none_is_distinct_from_no_entry() {
    let (cache, _) = store();
    cache.set::<Option<User>>("user_9", Arc::new(None));

    let hit = cache.get::<Option<User>>("user_9");
    assert!(matches!(hit.as_deref(), Some(None)));
    assert!(cache.get::<Option<User>>("user_10").is_none());
  }

  #[test]
  fn test_set_overwrites_and_resets_hits() {
    let (cache, _) = store();
    cache.set("k", Arc::new(1u8));
    cache.get::<u8>("k");
    cache.set("k", Arc::new(2u8));

    assert_eq!(cache.hits("k"), Some(0));
    assert_eq!(*cache.get::<u8>("k").unwrap(), 2);
  }

  #[test]
  fn test_invalidate_then_fresh_write() {
    let (cache, sink) = store();
    cache.set("k", Arc::new("old".to_string()));

    assert!(cache.invalidate("k"));
    assert!(cache.get::<String>("k").is_none());

    cache.set("k", Arc::new("new".to_string()));
    assert_eq!(cache.get::<String>("k").unwrap().as_str(), "new");

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data["entries_before"], 1);
    assert_eq!(records[0].data["entries_after"], 0);
  }

  #[test]
  fn test_invalidate_prefix() {
    let (cache, _) = store();
    cache.set("list_tasks_a", Arc::new(1));
    cache.set("list_tasks_b", Arc::new(2));
    cache.set("list_docs_a", Arc::new(3));

    assert_eq!(cache.invalidate_prefix("list_tasks_"), 2);
    assert_eq!(cache.keys(), vec!["list_docs_a".to_string()]);
  }

  #[test]
  fn test_invalidate_entity_spares_other_identities() {
    let (cache, sink) = store();
    let tasks = CacheKey::new(EntityKind::List, "Tasks");
    let archive = CacheKey::new(EntityKind::List, "Tasks_Archive");

    cache.set(tasks.build(), Arc::new(1));
    cache.set(tasks.clone().with_fields(&["Title"]).build(), Arc::new(2));
    cache.set(tasks.clone().on("root").build(), Arc::new(3));
    cache.set(archive.build(), Arc::new(4));
    cache.set(CacheKey::new(EntityKind::List, "Tasks2").build(), Arc::new(5));

    assert_eq!(cache.invalidate_entity(&tasks), 3);
    assert_eq!(
      cache.keys(),
      vec!["list_Tasks%5FArchive".to_string(), "list_Tasks2".to_string()]
    );

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data["entries_before"], 5);
    assert_eq!(records[0].data["entries_after"], 2);
  }

  #[test]
  fn test_clear_all() {
    let (cache, sink) = store();
    cache.set("a", Arc::new(1));
    cache.set("b", Arc::new(2));
    cache.clear_all();

    assert!(cache.is_empty());
    assert_eq!(sink.count(DiagnosticKind::CacheInvalidation), 1);
  }
}
