//! Lighthouse (IPFS) content store.
//!
//! Uploads go to the Lighthouse node, listings to the account API and reads
//! to the public IPFS gateway. All three need only the account's API key.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, instrument, trace};

use almoner_core::error::{StoreError, StoreResult};
use almoner_core::ports::{ContentRef, ContentStore, StoredObject};
use almoner_core::retry::RetryPolicy;

/// Lighthouse store configuration.
#[derive(Debug, Clone)]
pub struct LighthouseConfig {
    /// Account API key.
    pub api_key: String,
    /// Upload node (e.g., "https://node.lighthouse.storage").
    pub node_url: String,
    /// Account API (e.g., "https://api.lighthouse.storage").
    pub api_url: String,
    /// IPFS gateway (e.g., "https://gateway.lighthouse.storage").
    pub gateway_url: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Applied to listings and reads; uploads are sent once.
    pub retry: RetryPolicy,
}

impl Default for LighthouseConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            node_url: "https://node.lighthouse.storage".to_string(),
            api_url: "https://api.lighthouse.storage".to_string(),
            gateway_url: "https://gateway.lighthouse.storage".to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl LighthouseConfig {
    /// Public endpoints with the given API key.
    pub fn with_api_key(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            ..Default::default()
        }
    }
}

/// `POST /api/v0/add` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UploadResponse {
    name: String,
    hash: String,
}

/// `GET /api/user/files_uploaded` response page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadsPage {
    #[serde(default)]
    file_list: Vec<UploadedFile>,
    #[serde(default)]
    total_files: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedFile {
    file_name: String,
    cid: String,
    /// Paging cursor.
    id: String,
}

/// Content store backed by a Lighthouse account.
pub struct LighthouseStore {
    http: reqwest::Client,
    config: LighthouseConfig,
}

impl LighthouseStore {
    pub fn new(config: LighthouseConfig) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(http_error)?;
        Ok(Self { http, config })
    }

    fn gateway_url(&self, reference: &ContentRef) -> String {
        format!(
            "{}/ipfs/{}",
            self.config.gateway_url.trim_end_matches('/'),
            reference
        )
    }

    async fn fetch_uploads_page(&self, last_key: Option<&str>) -> StoreResult<UploadsPage> {
        let url = format!(
            "{}/api/user/files_uploaded",
            self.config.api_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.api_key)
            .query(&[("lastKey", last_key.unwrap_or("null"))])
            .send()
            .await
            .map_err(http_error)?;
        let response = check_status(response, "files_uploaded")?;
        response
            .json::<UploadsPage>()
            .await
            .map_err(|e| StoreError::Serialization(format!("files_uploaded: {e}")))
    }
}

#[async_trait]
impl ContentStore for LighthouseStore {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<ContentRef> {
        let part = Part::bytes(bytes)
            .file_name(key.to_string())
            .mime_str("application/json")
            .map_err(http_error)?;
        let form = Form::new().part("file", part);
        let url = format!("{}/api/v0/add", self.config.node_url.trim_end_matches('/'));

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(http_error)?;
        let response = check_status(response, "upload")?;
        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(format!("upload: {e}")))?;

        debug!(name = %uploaded.name, cid = %uploaded.hash, "📦 Uploaded to IPFS");
        Ok(ContentRef(uploaded.hash))
    }

    #[instrument(skip(self))]
    async fn list(&self) -> StoreResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut last_key: Option<String> = None;

        loop {
            let page = self
                .config
                .retry
                .run("lighthouse_list", || {
                    self.fetch_uploads_page(last_key.as_deref())
                })
                .await?;
            trace!(files = page.file_list.len(), total = page.total_files, "Uploads page");

            let Some(last) = page.file_list.last() else {
                break;
            };
            last_key = Some(last.id.clone());
            objects.extend(page.file_list.into_iter().map(|file| StoredObject {
                key: file.file_name,
                reference: ContentRef(file.cid),
            }));

            if objects.len() >= page.total_files {
                break;
            }
        }

        debug!(objects = objects.len(), "Listed uploads");
        Ok(objects)
    }

    #[instrument(skip(self), fields(cid = %reference))]
    async fn get(&self, reference: &ContentRef) -> StoreResult<Vec<u8>> {
        let url = self.gateway_url(reference);
        self.config
            .retry
            .run("lighthouse_get", || async {
                let response = self.http.get(&url).send().await.map_err(http_error)?;
                let response = check_status(response, "gateway")?;
                let bytes = response.bytes().await.map_err(http_error)?;
                Ok::<_, StoreError>(bytes.to_vec())
            })
            .await
    }
}

fn check_status(response: reqwest::Response, operation: &str) -> StoreResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(format!("{operation}: {}", response.url())),
        _ => StoreError::Unavailable(format!("{operation}: HTTP {status}")),
    })
}

fn http_error(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}
