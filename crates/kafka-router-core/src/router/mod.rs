//! Backend replica routing.
//!
//! Every request-scoped client (producer, cache, database) is held in a
//! [`BackendSet`]: a primary handle plus an optional shadow for benchmark
//! traffic and an optional gray handle for canary traffic. Callers ask the
//! set for a handle with their [`TraceContext`](crate::trace::TraceContext)
//! and never see which one they got.

pub mod backend_set;
pub mod read_write;
pub mod registry;

pub use backend_set::{cleanup_fn, noop_cleanup, Backend, BackendSet, Cleanup, CompositeCleanup, Scope};
pub use read_write::{ReadWriteScope, ReadWriteSet};
pub use registry::Registry;

/// Producer handles routed per request.
pub type Producers = BackendSet<std::sync::Arc<crate::producer::Producer>>;

/// Cache client handles routed per request.
pub type Caches<C> = BackendSet<C>;

/// Database handles routed per request, split into reads and writes.
pub type DataStores<D> = ReadWriteSet<D>;
