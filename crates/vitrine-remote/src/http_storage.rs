//! HTTP object storage transport.
//!
//! Protocol (all requests carry `Authorization: Bearer <token>`):
//!
//! | Operation | Request | Success |
//! |-----------|---------|---------|
//! | upload | `POST {base}/objects`, multipart part `file` | `{"key": "...", "size": n}` |
//! | fetch | `GET {base}/objects/{key}` | raw bytes |
//! | delete | `DELETE {base}/objects/{key}` | any 2xx, or 404 |
//!
//! Public URLs are `{public_base}/{key}` and need no token.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};

use vitrine_core::defaults::STORAGE_TIMEOUT_SECS;
use vitrine_core::logging::SUBSYSTEM_REMOTE;
use vitrine_core::{Error, ObjectStorage, Result, StoredObject};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    key: String,
    size: u64,
}

/// Object storage reached over HTTP.
#[derive(Clone)]
pub struct HttpObjectStorage {
    client: Client,
    base_url: String,
    public_base_url: String,
}

impl HttpObjectStorage {
    /// Create a transport with the default request timeout.
    pub fn new(base_url: impl Into<String>, public_base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(
            base_url,
            public_base_url,
            Duration::from_secs(STORAGE_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        public_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/objects/{}", self.base_url, key.trim_start_matches('/'))
    }
}

/// Map a non-success status to the error taxonomy.
///
/// 5xx, 408 and 429 are retryable transfer failures; 507 and 413 are
/// capacity failures; any other 4xx is a permanent rejection.
async fn status_error(op: &str, response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} returned {}: {}", op, status, body.trim());
    match status {
        StatusCode::INSUFFICIENT_STORAGE | StatusCode::PAYLOAD_TOO_LARGE => {
            Error::QuotaExceeded(detail)
        }
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Error::Transfer(detail),
        s if s.is_server_error() => Error::Transfer(detail),
        _ => Error::InvalidInput(detail),
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(&self, bytes: &[u8], name: &str, auth_token: &str) -> Result<StoredObject> {
        let start = Instant::now();
        let part = Part::bytes(bytes.to_vec())
            .file_name(name.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/objects", self.base_url))
            .bearer_auth(auth_token)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("upload", response).await);
        }

        let body: UploadResponse = response.json().await?;
        debug!(
            subsystem = SUBSYSTEM_REMOTE,
            component = "http_storage",
            op = "upload",
            object_key = %body.key,
            size_bytes = body.size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Object uploaded"
        );
        Ok(StoredObject {
            key: body.key,
            size: body.size,
        })
    }

    async fn fetch(&self, key: &str, auth_token: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.object_url(key))
            .bearer_auth(auth_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("fetch", response).await);
        }
        let bytes = response.bytes().await?;
        trace!(
            subsystem = SUBSYSTEM_REMOTE,
            component = "http_storage",
            op = "fetch",
            object_key = key,
            size_bytes = bytes.len(),
            "Object fetched"
        );
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str, auth_token: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.object_url(key))
            .bearer_auth(auth_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error("delete", response).await)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key.trim_start_matches('/'))
    }
}
