//! Response cache: versioned, named caches of HTTP response snapshots.
//!
//! Caches are segregated by resource class (static assets, dynamic pages, API
//! responses) and carry a version suffix. Obsolete versions are dropped as a
//! whole on activation; there is no per-entry expiry.

mod namespace;
mod served;
mod storage;
mod store;

pub use namespace::{Namespaces, ResourceClass};
pub use served::{ResponseSource, Served};
pub use storage::{CacheEntry, SqliteStorage};
pub use store::{Cache, CacheStore};
