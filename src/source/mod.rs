//! Remote source backends
//!
//! Abstracts over where bytes and revision markers come from. Two
//! variants: source-control repositories and cloud-storage buckets,
//! selected once from the configuration.

pub mod bucket;
pub mod github;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{SourceConfig, SourceKind};
use crate::error::Result;

pub use bucket::BucketSource;
pub use github::GithubSource;

/// Capability interface over a remote content store.
///
/// Revision resolution is deliberately a separate, cheaper call than the
/// content fetch: the whole point of the cache is to skip re-downloading
/// content whose revision marker has not moved.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Stable backend directory name under the cache root
    fn backend_name(&self) -> &'static str;

    /// Identity namespace disambiguating cache entries per configuration
    fn identity(&self) -> &str;

    /// Current revision marker of the path, without downloading content
    async fn resolve_revision(&self, path: &str) -> Result<String>;

    /// Full content of the path
    async fn fetch_content(&self, path: &str) -> Result<Vec<u8>>;
}

/// Instantiate the backend selected by the configuration
pub fn from_config(config: &SourceConfig) -> Result<Arc<dyn RemoteSource>> {
    match config.kind {
        SourceKind::SourceControl => Ok(Arc::new(GithubSource::new(config)?)),
        SourceKind::CloudStorage => Ok(Arc::new(BucketSource::new(config)?)),
    }
}
