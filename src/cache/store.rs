//! On-disk cache store
//!
//! Maps (source identity, remote path) pairs to local files under the
//! cache root and keeps a revision sidecar per entry. Content writes go
//! through a temp file and an atomic rename so readers never observe a
//! half-written file.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RemoteDataError, Result};

/// Subdirectory holding revision sidecars, mirroring the content tree
const META_DIR: &str = ".remotedata-meta";

/// A cached file plus its recorded revision state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub local_path: PathBuf,
    pub revision: String,
    pub fetched_at: u64,
}

/// Persisted sidecar record, one per cached file
#[derive(Debug, Serialize, Deserialize)]
struct SidecarRecord {
    revision: String,
    fetched_at: u64,
}

/// Durable mapping from remote paths to local files for one source identity
pub struct CacheStore {
    /// Directory holding this identity's content tree
    namespace_dir: PathBuf,
    /// Directory holding the revision sidecars
    meta_dir: PathBuf,
}

impl CacheStore {
    pub fn new(cache_root: &Path, backend: &str, identity: &str) -> Result<Self> {
        let namespace_dir = cache_root.join(backend).join(identity);
        let meta_dir = namespace_dir.join(META_DIR);
        fs::create_dir_all(&meta_dir).map_err(|e| storage_error(&meta_dir, e))?;

        let store = Self {
            namespace_dir,
            meta_dir,
        };
        store.cleanup();

        debug!(namespace = %store.namespace_dir.display(), "Cache store ready");
        Ok(store)
    }

    /// Read the entry for a path, if one exists. Never touches the
    /// network. A sidecar without its content file (or the reverse) is
    /// treated as absent and the orphan is dropped.
    pub fn lookup(&self, path: &str) -> Result<Option<CacheEntry>> {
        let relative = sanitized(path)?;
        let local_path = self.namespace_dir.join(&relative);
        let sidecar = self.sidecar_path(&relative);

        if !sidecar.exists() {
            return Ok(None);
        }
        if !local_path.exists() {
            warn!(path = path, "Dropping orphaned revision record");
            let _ = fs::remove_file(&sidecar);
            return Ok(None);
        }

        let raw = fs::read_to_string(&sidecar).map_err(|e| storage_error(&sidecar, e))?;
        match serde_json::from_str::<SidecarRecord>(&raw) {
            Ok(record) => Ok(Some(CacheEntry {
                local_path,
                revision: record.revision,
                fetched_at: record.fetched_at,
            })),
            Err(e) => {
                // A corrupt record is never trusted as valid
                warn!(path = path, error = %e, "Dropping unreadable revision record");
                let _ = fs::remove_file(&sidecar);
                Ok(None)
            }
        }
    }

    /// Store content and its revision for a path. Atomic from a reader's
    /// point of view: the content lands via rename, and the sidecar is
    /// written only after the rename succeeds.
    pub fn put(&self, path: &str, data: &[u8], revision: &str) -> Result<CacheEntry> {
        let relative = sanitized(path)?;
        let local_path = self.namespace_dir.join(&relative);

        let parent = match local_path.parent() {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
                parent
            }
            None => self.namespace_dir.as_path(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| storage_error(parent, e))?;
        tmp.write_all(data)
            .map_err(|e| storage_error(&local_path, e))?;
        tmp.persist(&local_path)
            .map_err(|e| storage_error(&local_path, e.error))?;

        let entry = CacheEntry {
            local_path,
            revision: revision.to_string(),
            fetched_at: unix_now(),
        };
        self.write_sidecar(&relative, &entry)?;

        debug!(
            path = path,
            local = %entry.local_path.display(),
            revision = revision,
            size = data.len(),
            "Stored cache entry"
        );
        Ok(entry)
    }

    /// Delete the content file and sidecar for a path; absent is a no-op
    pub fn remove(&self, path: &str) -> Result<()> {
        let relative = sanitized(path)?;
        remove_if_exists(&self.namespace_dir.join(&relative))?;
        remove_if_exists(&self.sidecar_path(&relative))?;
        debug!(path = path, "Removed cache entry");
        Ok(())
    }

    /// Remove every entry in this store's namespace. Sibling identities
    /// under the same cache root are untouched.
    pub fn clear(&self) -> Result<()> {
        if self.namespace_dir.exists() {
            fs::remove_dir_all(&self.namespace_dir)
                .map_err(|e| storage_error(&self.namespace_dir, e))?;
        }
        fs::create_dir_all(&self.meta_dir).map_err(|e| storage_error(&self.meta_dir, e))?;
        debug!(namespace = %self.namespace_dir.display(), "Cleared cache namespace");
        Ok(())
    }

    fn sidecar_path(&self, relative: &Path) -> PathBuf {
        let mut path = self.meta_dir.join(relative);
        if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
            path.set_file_name(format!("{name}.meta"));
        }
        path
    }

    fn write_sidecar(&self, relative: &Path, entry: &CacheEntry) -> Result<()> {
        let sidecar = self.sidecar_path(relative);
        let parent = match sidecar.parent() {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
                parent
            }
            None => self.meta_dir.as_path(),
        };

        let record = SidecarRecord {
            revision: entry.revision.clone(),
            fetched_at: entry.fetched_at,
        };
        let json = serde_json::to_string(&record).map_err(|e| {
            storage_error(&sidecar, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| storage_error(parent, e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| storage_error(&sidecar, e))?;
        tmp.persist(&sidecar)
            .map_err(|e| storage_error(&sidecar, e.error))?;
        Ok(())
    }

    /// Remove temp files left behind by interrupted writes
    fn cleanup(&self) {
        fn sweep(dir: &Path) {
            let Ok(read_dir) = fs::read_dir(dir) else {
                return;
            };
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    sweep(&path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(".tmp"))
                {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        sweep(&self.namespace_dir);
    }
}

/// Validate a caller-supplied remote path for safe placement under the
/// namespace directory
fn sanitized(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(RemoteDataError::InvalidConfig(
            "remote path is empty".to_string(),
        ));
    }
    let relative = Path::new(trimmed);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(RemoteDataError::InvalidConfig(format!(
                    "remote path {path:?} escapes the cache root"
                )))
            }
        }
    }
    Ok(relative.to_path_buf())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage_error(path, e)),
    }
}

fn storage_error(path: &Path, source: std::io::Error) -> RemoteDataError {
    RemoteDataError::StorageFailure {
        path: path.to_path_buf(),
        source,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
