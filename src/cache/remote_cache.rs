//! Cache orchestration
//!
//! Runs the freshness-check-then-fetch-or-reuse protocol on top of a
//! remote source and the on-disk store: look up the local entry, compare
//! its recorded revision with the remote one, and reuse, refresh, or
//! fetch accordingly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::store::{CacheEntry, CacheStore};
use crate::config::SourceConfig;
use crate::error::Result;
use crate::source::{self, RemoteSource};

/// Operation counters. A non-zero `degraded` count is the signal that a
/// freshness check failed and a stale entry was served instead.
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    degraded: AtomicU64,
}

/// Point-in-time snapshot of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub degraded: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Revision-aware local cache over a single remote source
pub struct RemoteDataCache {
    source: Arc<dyn RemoteSource>,
    store: CacheStore,
    /// Per-path locks, live only while an operation is in flight;
    /// holding one serializes the whole check-then-fetch protocol
    /// for that path
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stats: CacheStats,
}

impl RemoteDataCache {
    /// Build a cache for the configured source
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let source = source::from_config(config)?;
        Self::with_source(config, source)
    }

    /// Build a cache around an existing source (injection seam for tests
    /// and custom backends)
    pub fn with_source(config: &SourceConfig, source: Arc<dyn RemoteSource>) -> Result<Self> {
        let store = CacheStore::new(&config.cache_root, source.backend_name(), source.identity())?;
        info!(
            backend = source.backend_name(),
            identity = source.identity(),
            "Remote data cache ready"
        );
        Ok(Self {
            source,
            store,
            inflight: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        })
    }

    /// Get a local path for the remote path, reusing the cached copy when
    /// the remote revision is unchanged.
    ///
    /// Concurrent calls for the same path coalesce onto a single fetch;
    /// distinct paths proceed in parallel.
    pub async fn get(&self, path: &str) -> Result<PathBuf> {
        let lock = self.path_lock(path).await;
        let guard = lock.lock().await;

        let result = match self.store.lookup(path) {
            Ok(Some(entry)) => self.revalidate(path, entry).await,
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(path = path, "Cache MISS, fetching");
                self.fetch(path).await
            }
            Err(err) => Err(err),
        };

        drop(guard);
        self.release_path_lock(path, lock).await;
        result
    }

    /// Drop the cached copy of the path, if any
    pub async fn remove(&self, path: &str) -> Result<()> {
        let lock = self.path_lock(path).await;
        let guard = lock.lock().await;
        let result = self.store.remove(path);
        drop(guard);
        self.release_path_lock(path, lock).await;
        result
    }

    /// Drop every cached entry for this source identity. Operations
    /// already in flight are drained first so none of them can recreate
    /// an entry mid-clear; holding the lock registry keeps new
    /// operations waiting until the wipe completes.
    pub async fn clear(&self) -> Result<()> {
        let inflight = self.inflight.lock().await;
        let mut guards = Vec::with_capacity(inflight.len());
        for lock in inflight.values() {
            guards.push(lock.lock().await);
        }
        self.store.clear()
    }

    /// Counter snapshot for observability
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    async fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight.entry(path.to_string()).or_default().clone()
    }

    /// Drop the registry entry for a path once its last user is done,
    /// keeping the lock map bounded by the operations in flight. The
    /// caller's clone is surrendered under the registry lock, so the
    /// last one out always observes itself as last.
    async fn release_path_lock(&self, path: &str, lock: Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        drop(lock);
        // Only the registry's clone left: nobody is holding or
        // awaiting this lock
        if inflight
            .get(path)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            inflight.remove(path);
        }
    }

    async fn revalidate(&self, path: &str, entry: CacheEntry) -> Result<PathBuf> {
        match self.source.resolve_revision(path).await {
            Ok(revision) if revision == entry.revision => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(path = path, revision = %revision, "Cache HIT");
                Ok(entry.local_path)
            }
            Ok(revision) => {
                self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    path = path,
                    cached = %entry.revision,
                    remote = %revision,
                    "Revision changed, refreshing"
                );
                let data = self.source.fetch_content(path).await?;
                let entry = self.store.put(path, &data, &revision)?;
                Ok(entry.local_path)
            }
            Err(err) if err.is_transient() => {
                // Freshness cannot be confirmed; a stale file beats an error
                self.stats.degraded.fetch_add(1, Ordering::Relaxed);
                warn!(path = path, error = %err, "Revision check failed, serving stale cache entry");
                Ok(entry.local_path)
            }
            // The entry stays on disk as last known good state; callers
            // decide whether to remove it
            Err(err) => Err(err),
        }
    }

    async fn fetch(&self, path: &str) -> Result<PathBuf> {
        let revision = self.source.resolve_revision(path).await?;
        let data = self.source.fetch_content(path).await?;
        let entry = self.store.put(path, &data, &revision)?;
        Ok(entry.local_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceOptions;
    use crate::error::RemoteDataError;
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// What the stub's revision check should answer
    enum Reply {
        Revision(String),
        NotFound,
        RateLimited,
        Unavailable,
    }

    /// Scriptable in-memory source with call counters
    struct StubSource {
        identity: String,
        reply: StdMutex<Reply>,
        content: StdMutex<Vec<u8>>,
        resolve_calls: AtomicU64,
        fetch_calls: AtomicU64,
        fetch_delay: Option<Duration>,
    }

    impl StubSource {
        fn new(identity: &str, revision: &str, content: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                identity: identity.to_string(),
                reply: StdMutex::new(Reply::Revision(revision.to_string())),
                content: StdMutex::new(content.to_vec()),
                resolve_calls: AtomicU64::new(0),
                fetch_calls: AtomicU64::new(0),
                fetch_delay: None,
            })
        }

        fn set_remote(&self, revision: &str, content: &[u8]) {
            *self.reply.lock().unwrap() = Reply::Revision(revision.to_string());
            *self.content.lock().unwrap() = content.to_vec();
        }

        fn set_reply(&self, reply: Reply) {
            *self.reply.lock().unwrap() = reply;
        }

        fn resolve_calls(&self) -> u64 {
            self.resolve_calls.load(Ordering::SeqCst)
        }

        fn fetch_calls(&self) -> u64 {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSource for StubSource {
        fn backend_name(&self) -> &'static str {
            "source-control"
        }

        fn identity(&self) -> &str {
            &self.identity
        }

        async fn resolve_revision(&self, path: &str) -> Result<String> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            match &*self.reply.lock().unwrap() {
                Reply::Revision(revision) => Ok(revision.clone()),
                Reply::NotFound => Err(RemoteDataError::NotFound(path.to_string())),
                Reply::RateLimited => Err(RemoteDataError::RateLimited),
                Reply::Unavailable => {
                    Err(RemoteDataError::Unavailable("connection refused".to_string()))
                }
            }
        }

        async fn fetch_content(&self, _path: &str) -> Result<Vec<u8>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.content.lock().unwrap().clone())
        }
    }

    fn test_config(root: &Path) -> SourceConfig {
        SourceOptions {
            source: Some("source-control".to_string()),
            cache_root: Some(root.to_path_buf()),
            repository: Some("acme/data".to_string()),
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    fn test_cache(root: &Path, source: Arc<StubSource>) -> RemoteDataCache {
        RemoteDataCache::with_source(&test_config(root), source).unwrap()
    }

    #[tokio::test]
    async fn test_idempotent_hit() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = test_cache(root.path(), Arc::clone(&source));

        let first = cache.get("README.md").await.unwrap();
        assert_eq!(fs::read(&first).unwrap(), b"hello");
        assert_eq!(source.fetch_calls(), 1);
        assert_eq!(source.resolve_calls(), 1);

        // Unchanged remote: one metadata check, no content download
        let second = cache.get("README.md").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(fs::read(&second).unwrap(), b"hello");
        assert_eq!(source.fetch_calls(), 1);
        assert_eq!(source.resolve_calls(), 2);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.degraded, 0);
    }

    #[tokio::test]
    async fn test_change_detection_scenario() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = test_cache(root.path(), Arc::clone(&source));

        let local = cache.get("README.md").await.unwrap();
        assert_eq!(
            local,
            root.path().join("source-control/acme/data@main/README.md")
        );
        assert_eq!(fs::read(&local).unwrap(), b"hello");

        // Remote moves to a new commit
        source.set_remote("def456", b"hello world");
        let refreshed = cache.get("README.md").await.unwrap();
        assert_eq!(refreshed, local);
        assert_eq!(fs::read(&refreshed).unwrap(), b"hello world");
        assert_eq!(source.fetch_calls(), 2);
        assert_eq!(cache.stats().refreshes, 1);

        // The recorded revision followed the refresh
        let store = CacheStore::new(root.path(), "source-control", "acme/data@main").unwrap();
        let entry = store.lookup("README.md").unwrap().unwrap();
        assert_eq!(entry.revision, "def456");
    }

    #[tokio::test]
    async fn test_degrades_to_stale_on_rate_limit() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = test_cache(root.path(), Arc::clone(&source));

        let local = cache.get("README.md").await.unwrap();

        source.set_reply(Reply::RateLimited);
        let stale = cache.get("README.md").await.unwrap();
        assert_eq!(stale, local);
        assert_eq!(fs::read(&stale).unwrap(), b"hello");
        assert_eq!(source.fetch_calls(), 1);
        assert_eq!(cache.stats().degraded, 1);

        source.set_reply(Reply::Unavailable);
        let stale = cache.get("README.md").await.unwrap();
        assert_eq!(stale, local);
        assert_eq!(cache.stats().degraded, 2);
    }

    #[tokio::test]
    async fn test_not_found_propagates_and_keeps_entry() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = test_cache(root.path(), Arc::clone(&source));

        let local = cache.get("README.md").await.unwrap();

        // Remote deletion surfaces as NotFound, the stale entry stays as
        // last known good state
        source.set_reply(Reply::NotFound);
        let err = cache.get("README.md").await.unwrap_err();
        assert!(matches!(err, RemoteDataError::NotFound(_)));
        assert!(local.exists());

        let store = CacheStore::new(root.path(), "source-control", "acme/data@main").unwrap();
        assert!(store.lookup("README.md").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_first_fetch_failure_propagates() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = test_cache(root.path(), Arc::clone(&source));

        // No prior entry to fall back on: the error propagates unchanged
        source.set_reply(Reply::RateLimited);
        let err = cache.get("README.md").await.unwrap_err();
        assert!(matches!(err, RemoteDataError::RateLimited));

        let store = CacheStore::new(root.path(), "source-control", "acme/data@main").unwrap();
        assert!(store.lookup("README.md").unwrap().is_none());
        assert_eq!(source.fetch_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_coalesce() {
        let root = TempDir::new().unwrap();
        let source = Arc::new(StubSource {
            identity: "acme/data@main".to_string(),
            reply: StdMutex::new(Reply::Revision("abc123".to_string())),
            content: StdMutex::new(b"hello".to_vec()),
            resolve_calls: AtomicU64::new(0),
            fetch_calls: AtomicU64::new(0),
            fetch_delay: Some(Duration::from_millis(50)),
        });
        let cache = Arc::new(test_cache(root.path(), Arc::clone(&source)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(
                async move { cache.get("README.md").await },
            ));
        }

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap().unwrap());
        }

        // One download total; every caller got the same local path
        assert_eq!(source.fetch_calls(), 1);
        assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(fs::read(&paths[0]).unwrap(), b"hello");

        // The last caller out dropped the shared per-path lock
        assert!(cache.inflight.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_paths_fetch_in_parallel() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = Arc::new(test_cache(root.path(), Arc::clone(&source)));

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("a.txt").await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("b.txt").await })
        };

        let path_a = a.await.unwrap().unwrap();
        let path_b = b.await.unwrap().unwrap();
        assert_ne!(path_a, path_b);
        assert_eq!(source.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_path_lock_registry_stays_bounded() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = test_cache(root.path(), Arc::clone(&source));

        cache.get("a.txt").await.unwrap();
        cache.get("b.txt").await.unwrap();
        assert!(cache.inflight.lock().await.is_empty());

        cache.remove("a.txt").await.unwrap();
        assert!(cache.inflight.lock().await.is_empty());

        // Failed operations release their lock too
        source.set_reply(Reply::NotFound);
        cache.get("c.txt").await.unwrap_err();
        assert!(cache.inflight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_then_get_refetches() {
        let root = TempDir::new().unwrap();
        let source = StubSource::new("acme/data@main", "abc123", b"hello");
        let cache = test_cache(root.path(), Arc::clone(&source));

        let local = cache.get("README.md").await.unwrap();
        cache.remove("README.md").await.unwrap();
        assert!(!local.exists());

        let store = CacheStore::new(root.path(), "source-control", "acme/data@main").unwrap();
        assert!(store.lookup("README.md").unwrap().is_none());

        // Idempotent
        cache.remove("README.md").await.unwrap();

        cache.get("README.md").await.unwrap();
        assert_eq!(source.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_scopes_to_own_identity() {
        let root = TempDir::new().unwrap();
        let source_a = StubSource::new("acme/data@main", "abc123", b"a");
        let source_b = StubSource::new("acme/other@main", "abc123", b"b");
        let cache_a = test_cache(root.path(), Arc::clone(&source_a));
        let cache_b = test_cache(root.path(), Arc::clone(&source_b));

        cache_a.get("a.txt").await.unwrap();
        let kept = cache_b.get("b.txt").await.unwrap();

        cache_a.clear().await.unwrap();

        let store_a = CacheStore::new(root.path(), "source-control", "acme/data@main").unwrap();
        assert!(store_a.lookup("a.txt").unwrap().is_none());
        assert!(kept.exists());
    }
}
