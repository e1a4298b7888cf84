//! Local caching layer
//!
//! [`CacheStore`] owns the on-disk layout; [`RemoteDataCache`] runs the
//! freshness-check-then-fetch-or-reuse protocol on top of it.

pub mod remote_cache;
pub mod store;

pub use remote_cache::{CacheStatsSnapshot, RemoteDataCache};
pub use store::{CacheEntry, CacheStore};
