//! Source configuration
//!
//! Validates user-supplied options into a fully-resolved, immutable
//! [`SourceConfig`]. All derivation (default branch, identity namespace,
//! default cache root) happens here, once; nothing is re-derived at
//! request time.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RemoteDataError, Result};

/// Default request timeout for backend calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Branch tracked when the repository string does not name one
const DEFAULT_BRANCH: &str = "main";

/// Which remote backend a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    SourceControl,
    CloudStorage,
}

impl SourceKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "source-control" => Ok(SourceKind::SourceControl),
            "cloud-storage" => Ok(SourceKind::CloudStorage),
            other => Err(RemoteDataError::InvalidConfig(format!(
                "unsupported source: {other:?}, expected \"source-control\" or \"cloud-storage\""
            ))),
        }
    }
}

/// A source-control repository plus the branch whose revision line is tracked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl Repository {
    /// Parse `<owner>/<repo>` or `<owner>/<repo>/<branch>`; an explicit
    /// branch overrides the embedded one
    pub fn parse(spec: &str, branch: Option<&str>) -> Result<Self> {
        let invalid = || {
            RemoteDataError::InvalidConfig(format!(
                "invalid repository {spec:?}, expected \"<owner>/<repo>\""
            ))
        };

        let parts: Vec<&str> = spec.splitn(3, '/').collect();
        let (owner, repo, embedded) = match parts.as_slice() {
            [owner, repo] => (*owner, *repo, None),
            [owner, repo, embedded] if !embedded.is_empty() => (*owner, *repo, Some(*embedded)),
            _ => return Err(invalid()),
        };
        if owner.is_empty() || repo.is_empty() {
            return Err(invalid());
        }

        let branch = branch
            .filter(|b| !b.is_empty())
            .or(embedded)
            .unwrap_or(DEFAULT_BRANCH);

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
        })
    }

    /// Identity namespace, unique per repository and branch. Slashes in
    /// the branch name are escaped so two branches can never alias each
    /// other's directories.
    pub fn identity(&self) -> String {
        format!(
            "{}/{}@{}",
            self.owner,
            self.repo,
            urlencoding::encode(&self.branch)
        )
    }
}

/// Raw, unvalidated options as supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Backend selector: `source-control` or `cloud-storage`
    pub source: Option<String>,
    /// Base directory for all cached content and metadata
    pub cache_root: Option<PathBuf>,
    /// Repository as `<owner>/<repo>` or `<owner>/<repo>/<branch>`
    pub repository: Option<String>,
    /// Branch to track (overrides any branch embedded in `repository`)
    pub branch: Option<String>,
    /// Storage bucket name
    pub bucket: Option<String>,
    /// Credential token; `<keyId>:<applicationKey>` for cloud storage
    pub token: Option<String>,
    /// Timeout applied to every backend request
    pub request_timeout: Option<Duration>,
}

/// Fully-resolved source configuration, immutable after validation
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub cache_root: PathBuf,
    pub repository: Option<Repository>,
    pub bucket: Option<String>,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl SourceOptions {
    /// Validate and resolve into an immutable [`SourceConfig`]
    pub fn resolve(self) -> Result<SourceConfig> {
        let kind = match self.source.as_deref() {
            Some(s) => SourceKind::parse(s)?,
            None => {
                return Err(RemoteDataError::InvalidConfig(
                    "source required in configuration".to_string(),
                ))
            }
        };

        let cache_root = self.cache_root.unwrap_or_else(default_cache_root);
        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let mut config = SourceConfig {
            kind,
            cache_root,
            repository: None,
            bucket: None,
            token: self.token,
            request_timeout,
        };

        match kind {
            SourceKind::SourceControl => {
                let spec = self.repository.ok_or_else(|| {
                    RemoteDataError::InvalidConfig(
                        "repository required for a source-control source".to_string(),
                    )
                })?;
                config.repository = Some(Repository::parse(&spec, self.branch.as_deref())?);
            }
            SourceKind::CloudStorage => {
                let bucket = self.bucket.ok_or_else(|| {
                    RemoteDataError::InvalidConfig(
                        "bucket required for a cloud-storage source".to_string(),
                    )
                })?;
                // The storage API has no anonymous mode
                let token = config.token.as_deref().ok_or_else(|| {
                    RemoteDataError::InvalidConfig(
                        "token required for a cloud-storage source".to_string(),
                    )
                })?;
                if !token.contains(':') {
                    return Err(RemoteDataError::InvalidConfig(
                        "token must be <keyId>:<applicationKey> for a cloud-storage source"
                            .to_string(),
                    ));
                }
                config.bucket = Some(bucket);
            }
        }

        Ok(config)
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("remotedata")
}
