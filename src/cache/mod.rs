//! In-process cache of remotely fetched values.
//!
//! - `CacheStore` holds opaque, immutable snapshots keyed by string
//! - `CacheKey` builds those strings from an entity kind, identity and query shape
//! - Lookups never fail: a missing key is a normal miss

mod keys;
mod store;

pub use keys::{CacheKey, EntityKind};
pub use store::{CacheStats, CacheStore, EntryInfo};
