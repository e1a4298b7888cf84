//! Source-control backend (GitHub REST API)
//!
//! Resolves revisions via the commits API and downloads content via the
//! contents API, falling back to the blobs API for payloads the contents
//! API will not inline.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::debug;

use super::RemoteSource;
use crate::config::{Repository, SourceConfig};
use crate::error::{RemoteDataError, Result};

/// GitHub REST API base URL
const GITHUB_API_URL: &str = "https://api.github.com";

/// User agent sent with every request (the API rejects anonymous agents)
const USER_AGENT: &str = concat!("remotedata/", env!("CARGO_PKG_VERSION"));

/// Source-control remote backed by the GitHub REST API
pub struct GithubSource {
    http_client: Client,
    repository: Repository,
    identity: String,
    api_url: String,
    token: Option<String>,
}

/// One entry of the commits listing
#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

/// Response from the contents API for a single file
#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

/// Response from the git blobs API
#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

impl GithubSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let repository = config.repository.clone().ok_or_else(|| {
            RemoteDataError::InvalidConfig(
                "repository required for a source-control source".to_string(),
            )
        })?;

        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                RemoteDataError::Unavailable(format!("failed to create HTTP client: {e}"))
            })?;

        let identity = repository.identity();
        Ok(Self {
            http_client,
            repository,
            identity,
            api_url: GITHUB_API_URL.to_string(),
            token: config.token.clone(),
        })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http_client
            .get(url)
            .header(header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Map a non-success response, distinguishing rate-limit 403s from
    /// permission 403s via the quota headers
    async fn error_for(response: Response, path: &str) -> RemoteDataError {
        let status = response.status();
        if status == StatusCode::FORBIDDEN && rate_limit_exhausted(&response) {
            return RemoteDataError::RateLimited;
        }
        if status == StatusCode::NOT_FOUND {
            return RemoteDataError::NotFound(path.to_string());
        }
        let body = response.text().await.unwrap_or_default();
        RemoteDataError::from_status(status.as_u16(), &body)
    }

    /// Fetch raw bytes through the blobs API. The contents API declines
    /// to inline blobs over 1 MB; the blob SHA it returns still lets us
    /// download them directly.
    async fn fetch_blob(&self, sha: &str, path: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/repos/{}/{}/git/blobs/{}",
            self.api_url, self.repository.owner, self.repository.repo, sha
        );
        debug!(path = path, sha = sha, "Blob not inlined, fetching directly");

        let response = self
            .request(&url)
            .send()
            .await
            .map_err(RemoteDataError::from_transport)?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, path).await);
        }

        let blob: BlobResponse = response.json().await.map_err(|e| {
            RemoteDataError::Unavailable(format!("failed to parse blob response: {e}"))
        })?;
        if blob.encoding != "base64" {
            return Err(RemoteDataError::Unavailable(format!(
                "unexpected blob encoding: {}",
                blob.encoding
            )));
        }
        decode_payload(&blob.content)
    }
}

#[async_trait]
impl RemoteSource for GithubSource {
    fn backend_name(&self) -> &'static str {
        "source-control"
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn resolve_revision(&self, path: &str) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}/commits",
            self.api_url, self.repository.owner, self.repository.repo
        );

        let response = self
            .request(&url)
            .query(&[
                ("path", path),
                ("sha", self.repository.branch.as_str()),
                ("per_page", "1"),
            ])
            .send()
            .await
            .map_err(RemoteDataError::from_transport)?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, path).await);
        }

        let commits: Vec<CommitInfo> = response.json().await.map_err(|e| {
            RemoteDataError::Unavailable(format!("failed to parse commit listing: {e}"))
        })?;

        match commits.into_iter().next() {
            Some(commit) => {
                debug!(path = path, revision = %commit.sha, "Resolved remote revision");
                Ok(commit.sha)
            }
            // No commit touches the path on this branch
            None => Err(RemoteDataError::NotFound(path.to_string())),
        }
    }

    async fn fetch_content(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url, self.repository.owner, self.repository.repo, path
        );

        let response = self
            .request(&url)
            .query(&[("ref", self.repository.branch.as_str())])
            .send()
            .await
            .map_err(RemoteDataError::from_transport)?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, path).await);
        }

        let contents: ContentsResponse = response.json().await.map_err(|e| {
            RemoteDataError::Unavailable(format!("failed to parse contents response: {e}"))
        })?;

        let data = match (&contents.content, contents.encoding.as_deref()) {
            (Some(payload), Some("base64")) if !payload.is_empty() => decode_payload(payload)?,
            _ => self.fetch_blob(&contents.sha, path).await?,
        };

        let actual = git_blob_sha1(&data);
        if actual != contents.sha {
            return Err(RemoteDataError::ContentMismatch {
                path: path.to_string(),
                expected: contents.sha,
                actual,
            });
        }

        debug!(path = path, size = data.len(), "Downloaded file content");
        Ok(data)
    }
}

/// Whether the response carries an exhausted rate-limit quota
fn rate_limit_exhausted(response: &Response) -> bool {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0")
}

/// Decode a base64 payload as returned by the API (line-wrapped)
fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    let compact: String = payload.split_whitespace().collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| RemoteDataError::Unavailable(format!("invalid base64 payload: {e}")))
}

/// Git blob hash of raw content: sha1 of "blob {len}\0" followed by the bytes
fn git_blob_sha1(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", data.len()).as_bytes());
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
