//! On-demand, revision-aware caching of files from remote content stores.
//!
//! A [`RemoteDataCache`] treats files in a source-control repository or a
//! cloud-storage bucket as if they were local: the first `get` downloads
//! and caches the file, later `get`s reuse the copy until the remote
//! revision changes.

pub mod cache;
pub mod config;
pub mod error;
pub mod source;

pub use cache::{CacheEntry, CacheStatsSnapshot, RemoteDataCache};
pub use config::{SourceConfig, SourceKind, SourceOptions};
pub use error::{RemoteDataError, Result};
pub use source::RemoteSource;
