//! Cloud-storage backend (B2-style storage API)
//!
//! Revision tags come from the object metadata listing; content is
//! downloaded through the account's download URL and verified against the
//! declared SHA1.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::RemoteSource;
use crate::config::SourceConfig;
use crate::error::{RemoteDataError, Result};

/// Storage API base URL for account authorization
const AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// Cloud-storage remote backed by a B2-compatible storage API
pub struct BucketSource {
    http_client: Client,
    bucket: String,
    key_id: String,
    key: String,
    /// Cached account authorization, refreshed once on expiry
    auth_state: RwLock<Option<AuthState>>,
}

#[derive(Debug, Clone)]
struct AuthState {
    auth_token: String,
    api_url: String,
    download_url: String,
    bucket_id: String,
}

/// Response from b2_authorize_account
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    account_id: String,
    authorization_token: String,
    api_info: ApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInfo {
    storage_api: StorageApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageApiInfo {
    api_url: String,
    download_url: String,
}

/// Response from b2_list_buckets
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketInfo {
    bucket_id: String,
    bucket_name: String,
}

/// Request body for b2_list_file_names
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesRequest {
    bucket_id: String,
    prefix: String,
    max_file_count: u32,
}

/// Object metadata from the file listing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    file_name: String,
    #[serde(default)]
    content_sha1: Option<String>,
    #[serde(default)]
    file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFilesResponse {
    files: Vec<FileInfo>,
}

impl FileInfo {
    /// Revision tag for change detection. Large uploads report a SHA1 of
    /// "none"; the file id still changes with every new version.
    fn revision(&self) -> Option<String> {
        match self.content_sha1.as_deref() {
            Some("none") | None => self.file_id.clone(),
            Some(sha) => Some(sha.trim_start_matches("unverified:").to_string()),
        }
    }
}

impl BucketSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let bucket = config.bucket.clone().ok_or_else(|| {
            RemoteDataError::InvalidConfig("bucket required for a cloud-storage source".to_string())
        })?;
        let token = config.token.as_deref().ok_or_else(|| {
            RemoteDataError::InvalidConfig("token required for a cloud-storage source".to_string())
        })?;
        let (key_id, key) = token.split_once(':').ok_or_else(|| {
            RemoteDataError::InvalidConfig(
                "token must be <keyId>:<applicationKey> for a cloud-storage source".to_string(),
            )
        })?;

        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                RemoteDataError::Unavailable(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            bucket,
            key_id: key_id.to_string(),
            key: key.to_string(),
            auth_state: RwLock::new(None),
        })
    }

    /// Current authorization, performing the initial handshake on first use
    async fn auth(&self) -> Result<AuthState> {
        if let Some(state) = self.auth_state.read().await.clone() {
            return Ok(state);
        }
        self.refresh_auth().await
    }

    /// Re-authorize with the storage API and look up the bucket id
    async fn refresh_auth(&self) -> Result<AuthState> {
        info!(bucket = %self.bucket, "Authorizing with storage API");

        let credentials = format!("{}:{}", self.key_id, self.key);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);

        let response = self
            .http_client
            .get(AUTH_URL)
            .header("Authorization", format!("Basic {encoded}"))
            .send()
            .await
            .map_err(RemoteDataError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteDataError::from_status(status, &body));
        }

        let auth: AuthorizeAccountResponse = response.json().await.map_err(|e| {
            RemoteDataError::Unavailable(format!("failed to parse auth response: {e}"))
        })?;

        let bucket_id = self.lookup_bucket_id(&auth).await?;
        let state = AuthState {
            auth_token: auth.authorization_token,
            api_url: auth.api_info.storage_api.api_url,
            download_url: auth.api_info.storage_api.download_url,
            bucket_id,
        };

        debug!(api_url = %state.api_url, bucket_id = %state.bucket_id, "Storage authorization complete");
        *self.auth_state.write().await = Some(state.clone());
        Ok(state)
    }

    async fn lookup_bucket_id(&self, auth: &AuthorizeAccountResponse) -> Result<String> {
        let url = format!(
            "{}/b2api/v2/b2_list_buckets",
            auth.api_info.storage_api.api_url
        );

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", &auth.authorization_token)
            .json(&serde_json::json!({
                "accountId": auth.account_id,
                "bucketName": self.bucket
            }))
            .send()
            .await
            .map_err(RemoteDataError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteDataError::from_status(status, &body));
        }

        let list: ListBucketsResponse = response.json().await.map_err(|e| {
            RemoteDataError::Unavailable(format!("failed to parse bucket listing: {e}"))
        })?;

        list.buckets
            .into_iter()
            .find(|b| b.bucket_name == self.bucket)
            .map(|b| b.bucket_id)
            .ok_or_else(|| RemoteDataError::NotFound(format!("bucket {}", self.bucket)))
    }

    /// Look up object metadata by exact path. The storage API has no
    /// direct lookup, so this lists with the path as prefix and matches
    /// the name exactly.
    async fn file_info(&self, state: &AuthState, path: &str) -> Result<FileInfo> {
        let url = format!("{}/b2api/v2/b2_list_file_names", state.api_url);
        let request = ListFileNamesRequest {
            bucket_id: state.bucket_id.clone(),
            prefix: path.to_string(),
            max_file_count: 1,
        };

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", &state.auth_token)
            .json(&request)
            .send()
            .await
            .map_err(RemoteDataError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteDataError::from_status(status, &body));
        }

        let list: ListFilesResponse = response.json().await.map_err(|e| {
            RemoteDataError::Unavailable(format!("failed to parse file listing: {e}"))
        })?;

        list.files
            .into_iter()
            .find(|f| f.file_name == path)
            .ok_or_else(|| RemoteDataError::NotFound(path.to_string()))
    }

    async fn download(&self, state: &AuthState, path: &str) -> Result<Vec<u8>> {
        let encoded_name = urlencoding::encode(path);
        let url = format!("{}/file/{}/{}", state.download_url, self.bucket, encoded_name);
        debug!(path = path, "Downloading object");

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", &state.auth_token)
            .send()
            .await
            .map_err(RemoteDataError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteDataError::from_status(status, &body));
        }

        let declared = response
            .headers()
            .get("x-bz-content-sha1")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_start_matches("unverified:").to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(RemoteDataError::from_transport)?
            .to_vec();

        if let Some(expected) = declared.filter(|s| s != "none") {
            let actual = content_sha1(&bytes);
            if actual != expected {
                return Err(RemoteDataError::ContentMismatch {
                    path: path.to_string(),
                    expected,
                    actual,
                });
            }
        }

        debug!(path = path, size = bytes.len(), "Downloaded object content");
        Ok(bytes)
    }
}

#[async_trait]
impl RemoteSource for BucketSource {
    fn backend_name(&self) -> &'static str {
        "cloud-storage"
    }

    fn identity(&self) -> &str {
        &self.bucket
    }

    async fn resolve_revision(&self, path: &str) -> Result<String> {
        let state = self.auth().await?;
        let file_info = match self.file_info(&state, path).await {
            // Token expired mid-operation: refresh once and retry
            Err(RemoteDataError::Unauthorized(_)) => {
                let state = self.refresh_auth().await?;
                self.file_info(&state, path).await?
            }
            other => other?,
        };

        file_info.revision().ok_or_else(|| {
            RemoteDataError::Unavailable(format!("object {path} carries no revision marker"))
        })
    }

    async fn fetch_content(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.auth().await?;
        match self.download(&state, path).await {
            Err(RemoteDataError::Unauthorized(_)) => {
                let state = self.refresh_auth().await?;
                self.download(&state, path).await
            }
            other => other,
        }
    }
}

/// SHA1 of raw content, hex-encoded
fn content_sha1(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
