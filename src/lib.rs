//! Asynchronous resource cache and request coordination.
//!
//! - [`CacheStore`]: shared keyed cache of immutable snapshots
//! - [`RequestQueue`]: FIFO executor with concurrency 1 and cancellation of waiting items
//! - [`TimeoutRetry`]: per-attempt deadline with bounded retries
//! - [`Coordinator`]: "cached value, or fetch through the queue and cache it"
//! - [`Lazy`]: unloaded/loaded lifecycle for remote entities
//!
//! A [`Session`] owns one cache and one queue and is passed to everything
//! that needs them.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod queue;
pub mod resource;
pub mod retry;
pub mod session;

pub use cache::{CacheKey, CacheStore, EntityKind};
pub use config::Config;
pub use coordinator::{CancelHandle, Coordinator};
pub use diagnostics::{Diagnostic, DiagnosticsSink, MemorySink, TracingSink};
pub use error::{Error, Result};
pub use queue::{Pending, QueueKey, RequestQueue};
pub use resource::{Guard, Lazy, LoadState, Resource};
pub use retry::TimeoutRetry;
pub use session::Session;
