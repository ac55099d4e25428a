//! Cache-first request coordination.
//!
//! `coordinate` serves a cached value when one exists and otherwise runs the
//! fetch through the request queue, caching what it returns. Two callers that
//! miss on the same cold key both enqueue and both fetch: the queue orders
//! them but nothing collapses them into one request.
// TODO: collapse concurrent misses on one key with a map of in-flight fetches
// once callers no longer depend on each miss producing its own request.

use color_eyre::eyre::eyre;
use futures::future::{self, Either, Ready};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::queue::{Pending, QueueKey, RequestQueue};

/// Future returned by [`Coordinator::coordinate`].
pub type Coordinated<T> = Either<Ready<Result<Arc<T>>>, Pending<Arc<T>>>;

/// Future returned by [`Coordinator::coordinate_optional`].
pub type CoordinatedOptional<T> = Either<Ready<Result<Option<Arc<T>>>>, Pending<Option<Arc<T>>>>;

/// Cache plus queue, the entry point for fetching remote data.
#[derive(Clone, Debug)]
pub struct Coordinator {
  cache: Arc<CacheStore>,
  queue: RequestQueue,
}

impl Coordinator {
  pub fn new(cache: Arc<CacheStore>, queue: RequestQueue) -> Self {
    Self { cache, queue }
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  pub fn queue(&self) -> &RequestQueue {
    &self.queue
  }

  /// Cached value for `key`, or else `fetch` run through the queue.
  ///
  /// The cache lookup and the enqueue happen when this is called. The fetched
  /// value is cached as part of the queued work, so it lands in the cache
  /// even if the returned future is dropped. Failures are not cached.
  /// `QueueKey::Unkeyed` bypasses the cache entirely.
  pub fn coordinate<T, F, Fut>(&self, key: impl Into<QueueKey>, fetch: F) -> Coordinated<T>
  where
    T: Any + Send + Sync,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    self.coordinate_by(
      key.into(),
      move || async move { fetch().await.map(Arc::new) },
      |hit: Arc<T>| hit,
      |value: &Arc<T>| Some(Arc::clone(value)),
    )
  }

  /// Like [`coordinate`](Self::coordinate) for fetches that may find nothing.
  ///
  /// `Ok(None)` is passed through and not cached, so the next call fetches
  /// again.
  pub fn coordinate_optional<T, F, Fut>(
    &self,
    key: impl Into<QueueKey>,
    fetch: F,
  ) -> CoordinatedOptional<T>
  where
    T: Any + Send + Sync,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<Option<T>>> + Send + 'static,
  {
    self.coordinate_by(
      key.into(),
      move || async move { fetch().await.map(|found| found.map(Arc::new)) },
      |hit: Arc<T>| Some(hit),
      |value: &Option<Arc<T>>| value.clone(),
    )
  }

  /// Cache lookup, then enqueue a fetch that writes back what `to_cache` picks.
  fn coordinate_by<T, V, F, Fut>(
    &self,
    key: QueueKey,
    fetch: F,
    from_hit: fn(Arc<T>) -> V,
    to_cache: fn(&V) -> Option<Arc<T>>,
  ) -> Either<Ready<Result<V>>, Pending<V>>
  where
    T: Any + Send + Sync,
    V: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<V>> + Send + 'static,
  {
    let cache_key = match &key {
      QueueKey::Keyed(k) => k.clone(),
      QueueKey::Unkeyed => return Either::Right(self.queue.enqueue(key, fetch)),
    };

    if let Some(hit) = self.cache.get::<T>(&cache_key) {
      debug!(key = %cache_key, "served from cache");
      return Either::Left(future::ready(Ok(from_hit(hit))));
    }

    let cache = Arc::clone(&self.cache);
    Either::Right(self.queue.enqueue(key, move || async move {
      fetch().await.map(|value| {
        if let Some(cached) = to_cache(&value) {
          cache.set(cache_key, cached);
        }
        value
      })
    }))
  }

  /// Callback form of [`coordinate`](Self::coordinate).
  ///
  /// On a cache hit `callback` runs before this returns. Otherwise it runs on
  /// the queue once the fetch settles, with the value or the fetch error. The
  /// handle cancels the request while it is still waiting; a cancelled
  /// request never calls back.
  pub fn coordinate_with_callback<T, F, Fut, C>(
    &self,
    key: impl Into<QueueKey>,
    fetch: F,
    callback: C,
  ) -> CancelHandle
  where
    T: Any + Send + Sync,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
    C: FnOnce(Result<Arc<T>>) + Send + 'static,
  {
    let key = key.into();
    let handle = CancelHandle {
      key: key.clone(),
      queue: self.queue.clone(),
    };

    if let QueueKey::Keyed(k) = &key {
      if let Some(hit) = self.cache.get::<T>(k) {
        debug!(key = %k, "served from cache");
        callback(Ok(hit));
        return handle;
      }
    }

    let cache = Arc::clone(&self.cache);
    let queued_key = key.clone();
    let _ = self.queue.enqueue(key, move || async move {
      match fetch().await {
        Ok(value) => {
          let value = Arc::new(value);
          if let QueueKey::Keyed(k) = &queued_key {
            cache.set(k.clone(), Arc::clone(&value));
          }
          callback(Ok(value));
          Ok(())
        }
        Err(report) => {
          let message = format!("{:#}", report);
          callback(Err(Error::fetch(queued_key.to_string(), report)));
          Err(eyre!(message))
        }
      }
    });

    handle
  }
}

/// Cancels one queued request by key.
#[derive(Debug, Clone)]
pub struct CancelHandle {
  key: QueueKey,
  queue: RequestQueue,
}

impl CancelHandle {
  pub fn key(&self) -> &QueueKey {
    &self.key
  }

  /// False once the request has started, or for unkeyed requests.
  pub fn cancel(&self) -> bool {
    match self.key.as_str() {
      Some(key) => self.queue.cancel(key),
      None => false,
    }
  }
}
