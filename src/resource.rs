//! Lazily loaded, remotely backed resources.
//!
//! Every entity (list, item, user, group, file, page, ...) starts unloaded and
//! becomes loaded after a successful `get`. Loading checks the session cache
//! first and otherwise fetches through the request queue.
//!
//! # Example
//!
//! ```ignore
//! struct SiteUser { id: u32, client: Client }
//!
//! impl Resource for SiteUser {
//!     type Payload = UserInfo;
//!     fn kind(&self) -> EntityKind { EntityKind::User }
//!     fn identity(&self) -> String { self.id.to_string() }
//!     fn fetch(&self) -> BoxFuture<'static, color_eyre::Result<Option<UserInfo>>> {
//!         let client = self.client.clone();
//!         let id = self.id;
//!         async move { client.user(id).await }.boxed()
//!     }
//! }
//!
//! let mut user = session.lazy(SiteUser { id: 42, client });
//! if let Some(info) = user.get().await {
//!     println!("{}", info.name);
//! }
//! ```

use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheKey, EntityKind};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Severity};
use crate::error::{Error, Result};
use crate::session::Session;

/// A remote entity that can be fetched and cached.
pub trait Resource: Send + Sync + 'static {
  type Payload: Send + Sync + 'static;

  fn kind(&self) -> EntityKind;

  /// Whatever identifies this entity remotely (id, title, url)
  fn identity(&self) -> String;

  /// Cache key for the payload. Override to include a query shape or scope.
  fn cache_key(&self) -> CacheKey {
    CacheKey::new(self.kind(), self.identity())
  }

  /// Fetch the payload. `Ok(None)` means the remote had nothing to return.
  fn fetch(&self) -> BoxFuture<'static, color_eyre::Result<Option<Self::Payload>>>;

  /// Whether fetches go through the session's request queue.
  fn queued(&self) -> bool {
    true
  }
}

/// How an accessor reacts to unloaded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
  /// Report and return `false`
  Soft,
  /// Report and fail with `Error::NotLoaded`
  Harsh,
}

/// Load state; the payload exists exactly when loaded.
#[derive(Debug)]
pub enum LoadState<P> {
  Unloaded,
  Loaded(Arc<P>),
}

impl<P> LoadState<P> {
  pub fn is_loaded(&self) -> bool {
    matches!(self, LoadState::Loaded(_))
  }

  pub fn payload(&self) -> Option<&Arc<P>> {
    match self {
      LoadState::Loaded(payload) => Some(payload),
      LoadState::Unloaded => None,
    }
  }
}

/// Unloaded/loaded lifecycle around a [`Resource`].
pub struct Lazy<R: Resource> {
  resource: R,
  session: Arc<Session>,
  state: LoadState<R::Payload>,
  last_error: Option<Arc<Error>>,
}

impl<R: Resource> Lazy<R> {
  pub fn new(session: Arc<Session>, resource: R) -> Self {
    Self {
      resource,
      session,
      state: LoadState::Unloaded,
      last_error: None,
    }
  }

  pub fn resource(&self) -> &R {
    &self.resource
  }

  pub fn state(&self) -> &LoadState<R::Payload> {
    &self.state
  }

  pub fn is_loaded(&self) -> bool {
    self.state.is_loaded()
  }

  /// Why the most recent load failed, cleared by the next successful load.
  pub fn last_error(&self) -> Option<&Error> {
    self.last_error.as_deref()
  }

  pub fn cache_key(&self) -> String {
    self.resource.cache_key().build()
  }

  /// Load if needed and return the payload, or `None` if loading failed.
  ///
  /// A failed load leaves the resource unloaded; the cause is kept in
  /// [`last_error`](Self::last_error) and the next call tries again.
  pub async fn get(&mut self) -> Option<Arc<R::Payload>> {
    self.load().await.ok()
  }

  /// Like [`get`](Self::get), but returns the failure.
  pub async fn load(&mut self) -> Result<Arc<R::Payload>> {
    if let LoadState::Loaded(payload) = &self.state {
      return Ok(Arc::clone(payload));
    }

    let key = self.cache_key();
    let cache = Arc::clone(self.session.cache());

    if let Some(hit) = cache.get::<R::Payload>(&key) {
      debug!(key = %key, "adopted cached payload");
      return Ok(self.adopt(hit));
    }

    let fetch = self.resource.fetch();
    let fetched = if self.resource.queued() {
      self
        .session
        .coordinator()
        .coordinate_optional(key.clone(), move || fetch)
        .await
    } else {
      fetch
        .await
        .map(|found| {
          let found = found.map(Arc::new);
          if let Some(payload) = &found {
            cache.set(key.clone(), Arc::clone(payload));
          }
          found
        })
        .map_err(|e| Error::fetch(key.clone(), e))
    };

    let failure = match fetched {
      Ok(Some(payload)) => return Ok(self.adopt(payload)),
      Ok(None) => Error::EmptyPayload { key },
      Err(e) => e,
    };

    warn!(
      kind = %self.resource.kind(),
      identity = %self.resource.identity(),
      error = %failure,
      "load failed"
    );
    let failure = Arc::new(failure);
    self.last_error = Some(Arc::clone(&failure));
    Err(Error::Load {
      kind: self.resource.kind().as_str(),
      identity: self.resource.identity(),
      source: failure,
    })
  }

  /// Invalidate the cached payload and load again.
  ///
  /// Safe on a never-loaded resource. If the reload fails, the previous
  /// state is put back (the cache entry stays invalidated) and the error says
  /// whether the resource had been loaded.
  pub async fn refresh(&mut self) -> Result<Arc<R::Payload>> {
    let key = self.cache_key();
    self.session.cache().invalidate(&key);
    let previous = std::mem::replace(&mut self.state, LoadState::Unloaded);

    match self.load().await {
      Ok(payload) => Ok(payload),
      Err(e) => {
        let was_loaded = previous.is_loaded();
        self.state = previous;
        let source = match e {
          Error::Load { source, .. } => source,
          other => Arc::new(other),
        };
        Err(Error::RefreshFailed {
          kind: self.resource.kind().as_str(),
          identity: self.resource.identity(),
          was_loaded,
          source,
        })
      }
    }
  }

  /// Forget the local payload without touching the cache.
  pub fn reset(&mut self) {
    self.state = LoadState::Unloaded;
  }

  /// Guard for accessors that need the payload.
  ///
  /// Returns `Ok(true)` when loaded. Otherwise reports an unloaded-access
  /// diagnostic and returns `Ok(false)` (soft) or `Error::NotLoaded` (harsh).
  pub fn check_unloaded(&self, guard: Guard) -> Result<bool> {
    if self.state.is_loaded() {
      return Ok(true);
    }

    let kind = self.resource.kind();
    let identity = self.resource.identity();
    self.session.sink().report(Diagnostic {
      component: format!("{} {}", kind, identity),
      message: format!("{} {} was accessed before it was loaded", kind, identity),
      kind: DiagnosticKind::UnloadedAccess,
      role: "resource",
      severity: match guard {
        Guard::Soft => Severity::Warning,
        Guard::Harsh => Severity::Error,
      },
      data: json!({
        "kind": kind.as_str(),
        "identity": identity,
        "key": self.cache_key(),
        "harsh": guard == Guard::Harsh,
      }),
    });

    match guard {
      Guard::Soft => Ok(false),
      Guard::Harsh => Err(Error::NotLoaded {
        kind: kind.as_str(),
        identity,
      }),
    }
  }

  /// Payload through the soft guard: `None` (and a diagnostic) when unloaded.
  pub fn data(&self) -> Option<Arc<R::Payload>> {
    match self.check_unloaded(Guard::Soft) {
      Ok(true) => self.state.payload().cloned(),
      _ => None,
    }
  }

  /// Payload through the harsh guard.
  pub fn require(&self) -> Result<Arc<R::Payload>> {
    self.check_unloaded(Guard::Harsh)?;
    self
      .state
      .payload()
      .cloned()
      .ok_or_else(|| Error::NotLoaded {
        kind: self.resource.kind().as_str(),
        identity: self.resource.identity(),
      })
  }

  fn adopt(&mut self, payload: Arc<R::Payload>) -> Arc<R::Payload> {
    self.state = LoadState::Loaded(Arc::clone(&payload));
    self.last_error = None;
    payload
  }
}

impl<R: Resource> std::fmt::Debug for Lazy<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Lazy")
      .field("kind", &self.resource.kind())
      .field("identity", &self.resource.identity())
      .field("loaded", &self.state.is_loaded())
      .field("last_error", &self.last_error)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::diagnostics::MemorySink;
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use parking_lot::Mutex;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Debug, Clone, PartialEq)]
  struct ListInfo {
    title: String,
    version: u32,
  }

  #[derive(Debug, Clone, Copy)]
  enum Reply {
    Payload,
    Empty,
    Fail,
  }

  /// A list whose remote reply can be switched between calls.
  struct TestList {
    title: &'static str,
    calls: Arc<AtomicU32>,
    reply: Arc<Mutex<Reply>>,
    queued: bool,
  }

  impl TestList {
    fn new(title: &'static str) -> Self {
      Self {
        title,
        calls: Arc::new(AtomicU32::new(0)),
        reply: Arc::new(Mutex::new(Reply::Payload)),
        queued: true,
      }
    }

    fn sharing_counter(&self) -> Self {
      Self {
        title: self.title,
        calls: self.calls.clone(),
        reply: self.reply.clone(),
        queued: self.queued,
      }
    }
  }

  impl Resource for TestList {
    type Payload = ListInfo;

    fn kind(&self) -> EntityKind {
      EntityKind::List
    }

    fn identity(&self) -> String {
      self.title.to_string()
    }

    fn fetch(&self) -> BoxFuture<'static, color_eyre::Result<Option<ListInfo>>> {
      let version = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      let reply = *self.reply.lock();
      let title = self.title.to_string();
      async move {
        match reply {
          Reply::Payload => Ok(Some(ListInfo { title, version })),
          Reply::Empty => Ok(None),
          Reply::Fail => Err(eyre!("503 service unavailable")),
        }
      }
      .boxed()
    }

    fn queued(&self) -> bool {
      self.queued
    }
  }

  fn session() -> (Arc<Session>, MemorySink) {
    let sink = MemorySink::new();
    let mut config = Config::default();
    config.queue.settle_delay_ms = 1;
    (Session::new(&config, Arc::new(sink.clone())), sink)
  }

  #[tokio::test]
  async fn test_fresh_resource_is_unloaded_and_guards() {
    let (session, sink) = session();
    let list = session.lazy(TestList::new("Tasks"));

    assert!(!list.is_loaded());
    assert!(!list.check_unloaded(Guard::Soft).unwrap());
    assert_eq!(sink.count(DiagnosticKind::UnloadedAccess), 1);

    let harsh = list.check_unloaded(Guard::Harsh);
    assert!(matches!(harsh, Err(Error::NotLoaded { kind: "list", .. })));
    assert_eq!(sink.count(DiagnosticKind::UnloadedAccess), 2);

    let records = sink.records();
    assert_eq!(records[0].component, "list Tasks");
    assert_eq!(records[0].severity, Severity::Warning);
    assert_eq!(records[1].severity, Severity::Error);
    assert_eq!(records[1].data["identity"], "Tasks");
  }

  #[tokio::test]
  async fn test_loaded_resource_passes_guards_silently() {
    let (session, sink) = session();
    let mut list = session.lazy(TestList::new("Tasks"));

    let info = list.get().await.unwrap();
    assert_eq!(info.title, "Tasks");
    assert!(list.is_loaded());

    sink.clear();
    assert!(list.check_unloaded(Guard::Soft).unwrap());
    assert!(list.check_unloaded(Guard::Harsh).unwrap());
    assert!(sink.records().is_empty());
  }

  #[tokio::test]
  async fn test_get_is_idempotent() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    let calls = resource.calls.clone();
    let mut list = session.lazy(resource);

    let first = list.get().await.unwrap();
    let second = list.get().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_second_instance_adopts_cached_payload() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    let calls = resource.calls.clone();
    let mut a = session.lazy(resource.sharing_counter());
    let mut b = session.lazy(resource);

    let from_fetch = a.get().await.unwrap();
    let from_cache = b.get().await.unwrap();

    assert!(Arc::ptr_eq(&from_fetch, &from_cache));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(b.is_loaded());
  }

  #[tokio::test]
  async fn test_failed_load_stays_unloaded_and_keeps_cause() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    let reply = resource.reply.clone();
    *reply.lock() = Reply::Fail;
    let mut list = session.lazy(resource);

    assert!(list.get().await.is_none());
    assert!(!list.is_loaded());
    assert!(matches!(list.last_error(), Some(Error::Fetch { .. })));
    assert!(!session.cache().contains(&list.cache_key()));

    *reply.lock() = Reply::Payload;
    let info = list.get().await.unwrap();
    assert_eq!(info.version, 2);
    assert!(list.last_error().is_none());
  }

  #[tokio::test]
  async fn test_load_reports_failure() {
    let (session, _) = session();
    let resource = TestList::new("Docs");
    *resource.reply.lock() = Reply::Fail;
    let mut list = session.lazy(resource);

    match list.load().await {
      Err(Error::Load { kind, identity, source }) => {
        assert_eq!(kind, "list");
        assert_eq!(identity, "Docs");
        assert!(matches!(*source, Error::Fetch { .. }));
      }
      other => panic!("expected load error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_empty_payload_is_not_loaded_or_cached() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    *resource.reply.lock() = Reply::Empty;
    let mut list = session.lazy(resource);

    assert!(list.get().await.is_none());
    assert!(!list.is_loaded());
    assert!(matches!(list.last_error(), Some(Error::EmptyPayload { .. })));
    assert!(session.cache().is_empty());
  }

  #[tokio::test]
  async fn test_refresh_fetches_even_when_cached() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    let calls = resource.calls.clone();
    let mut list = session.lazy(resource);

    list.get().await.unwrap();
    assert!(session.cache().contains(&list.cache_key()));

    let refreshed = list.refresh().await.unwrap();
    assert_eq!(refreshed.version, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
      session.cache().get::<ListInfo>(&list.cache_key()).unwrap().version,
      2
    );
  }

  #[tokio::test]
  async fn test_refresh_on_never_loaded_resource() {
    let (session, _) = session();
    let mut list = session.lazy(TestList::new("Tasks"));

    let info = list.refresh().await.unwrap();
    assert_eq!(info.version, 1);
    assert!(list.is_loaded());
  }

  #[tokio::test]
  async fn test_failed_refresh_restores_previous_state() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    let reply = resource.reply.clone();
    let mut list = session.lazy(resource);

    let before = list.get().await.unwrap();
    *reply.lock() = Reply::Fail;

    match list.refresh().await {
      Err(Error::RefreshFailed { was_loaded, .. }) => assert!(was_loaded),
      other => panic!("expected refresh failure, got {:?}", other),
    }

    assert!(list.is_loaded());
    assert!(Arc::ptr_eq(&list.data().unwrap(), &before));
    assert!(list.last_error().is_some());
    assert!(!session.cache().contains(&list.cache_key()));
  }

  #[tokio::test]
  async fn test_failed_refresh_of_unloaded_resource() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    *resource.reply.lock() = Reply::Fail;
    let mut list = session.lazy(resource);

    match list.refresh().await {
      Err(Error::RefreshFailed { was_loaded, .. }) => assert!(!was_loaded),
      other => panic!("expected refresh failure, got {:?}", other),
    }
    assert!(!list.is_loaded());
  }

  #[tokio::test]
  async fn test_accessors_degrade_when_unloaded() {
    let (session, sink) = session();
    let list = session.lazy(TestList::new("Tasks"));

    assert!(list.data().is_none());
    assert!(matches!(list.require(), Err(Error::NotLoaded { .. })));
    assert_eq!(sink.count(DiagnosticKind::UnloadedAccess), 2);
  }

  #[tokio::test]
  async fn test_reset_keeps_cache() {
    let (session, _) = session();
    let resource = TestList::new("Tasks");
    let calls = resource.calls.clone();
    let mut list = session.lazy(resource);

    list.get().await.unwrap();
    list.reset();
    assert!(!list.is_loaded());

    list.get().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_unqueued_fetch_bypasses_queue() {
    let (session, _) = session();
    let mut resource = TestList::new("Tasks");
    resource.queued = false;
    let mut list = session.lazy(resource);

    // Hold the queue busy; an unqueued load must not wait for it
    let _busy = session.queue().enqueue("busy", || async {
      tokio::time::sleep(std::time::Duration::from_millis(200)).await;
      Ok(())
    });

    let loaded = tokio::time::timeout(std::time::Duration::from_millis(50), list.get()).await;
    assert!(loaded.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_shaped_key_is_used_for_cache() {
    struct ScopedUser;

    impl Resource for ScopedUser {
      type Payload = String;

      fn kind(&self) -> EntityKind {
        EntityKind::User
      }

      fn identity(&self) -> String {
        "42".to_string()
      }

      fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.kind(), self.identity())
          .with_fields(&["Title", "Email"])
          .on("root")
      }

      fn fetch(&self) -> BoxFuture<'static, color_eyre::Result<Option<String>>> {
        async { Ok(Some("Ada".to_string())) }.boxed()
      }
    }

    let (session, _) = session();
    let mut user = session.lazy(ScopedUser);
    user.get().await.unwrap();

    assert_eq!(session.cache().keys(), vec!["user_42_Title-Email_on_root".to_string()]);
  }
}
