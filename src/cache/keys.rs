//! Cache key construction.
//!
//! Keys follow `<kind>_<identity>[_<shape>][_on_<scope>]`. All key strings in
//! the crate come from here so the format has a single definition.
//!
//! `_` and `%` inside the identity are percent-escaped, so the identity always
//! ends at the second `_` and one entity's keys never run into another's.

use sha2::{Digest, Sha256};
use std::fmt;

/// Kinds of remote entities that get cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
  Site,
  List,
  Item,
  User,
  Group,
  File,
  Page,
  Field,
  View,
}

impl EntityKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Site => "site",
      Self::List => "list",
      Self::Item => "item",
      Self::User => "user",
      Self::Group => "group",
      Self::File => "file",
      Self::Page => "page",
      Self::Field => "field",
      Self::View => "view",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Builder for a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  kind: EntityKind,
  identity: String,
  shape: Option<String>,
  scope: Option<String>,
}

impl CacheKey {
  pub fn new(kind: EntityKind, identity: impl fmt::Display) -> Self {
    Self {
      kind,
      identity: identity.to_string(),
      shape: None,
      scope: None,
    }
  }

  /// Append the selected fields, in the order given.
  pub fn with_fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
    if !fields.is_empty() {
      let joined: Vec<&str> = fields.iter().map(AsRef::as_ref).collect();
      self.shape = Some(joined.join("-"));
    }
    self
  }

  /// Append a free-form query (filter, CAML, select/expand string).
  ///
  /// Queries can be arbitrarily long, so they are hashed. Only surrounding
  /// whitespace is ignored; literals are case-sensitive.
  pub fn with_query(mut self, query: &str) -> Self {
    self.shape = Some(query_digest(query));
    self
  }

  /// Scope the key to a site or tenant.
  pub fn on(mut self, scope: impl fmt::Display) -> Self {
    self.scope = Some(scope.to_string());
    self
  }

  pub fn kind(&self) -> EntityKind {
    self.kind
  }

  pub fn identity(&self) -> &str {
    &self.identity
  }

  /// `<kind>_<identity>` without shape or scope.
  pub fn base(&self) -> String {
    format!("{}_{}", self.kind, escape_identity(&self.identity))
  }

  /// Whether `key` belongs to this key's entity: the plain key or any shaped
  /// or scoped variant of it.
  pub fn covers(&self, key: &str) -> bool {
    let base = self.base();
    match key.strip_prefix(base.as_str()) {
      Some(rest) => rest.is_empty() || rest.starts_with('_'),
      None => false,
    }
  }

  pub fn build(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}_{}", self.kind, escape_identity(&self.identity))?;
    if let Some(shape) = &self.shape {
      write!(f, "_{}", shape)?;
    }
    if let Some(scope) = &self.scope {
      write!(f, "_on_{}", scope)?;
    }
    Ok(())
  }
}

impl From<CacheKey> for String {
  fn from(key: CacheKey) -> Self {
    key.to_string()
  }
}

fn escape_identity(identity: &str) -> String {
  identity.replace('%', "%25").replace('_', "%5F")
}

/// First 16 hex digits of the SHA-256 of the trimmed query.
fn query_digest(query: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(query.trim().as_bytes());
  let mut digest = hex::encode(hasher.finalize());
  digest.truncate(16);
  digest
}
