//! PUTs to presigned object-store URLs

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, ETAG};

use super::checksum::strip_etag_quotes;
use crate::error::{IngestorError, Result};
use crate::protocol::check_status;

/// Header carrying the base64 SHA-256 of the request body
pub const CHECKSUM_HEADER: &str = "x-amz-checksum-sha256";

/// Single-attempt PUT of a body to a presigned URL
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `body`; returns the response ETag with quotes stripped, if any
    async fn put(&self, url: &str, body: Bytes, checksum_sha256: &str) -> Result<Option<String>>;
}

/// [`ObjectStore`] over a process-wide reqwest connection pool
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    http: reqwest::Client,
}

static SHARED_HTTP: OnceLock<reqwest::Client> = OnceLock::new();

impl HttpObjectStore {
    /// Store sharing one connection pool across all tasks
    ///
    /// The timeout of the first call wins.
    pub fn shared(timeout: Duration) -> Result<Self> {
        if let Some(http) = SHARED_HTTP.get() {
            return Ok(Self { http: http.clone() });
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestorError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http: SHARED_HTTP.get_or_init(|| http).clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, url: &str, body: Bytes, checksum_sha256: &str) -> Result<Option<String>> {
        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CHECKSUM_HEADER, checksum_sha256)
            .body(body)
            .send()
            .await?;
        let response = check_status("object store", response).await?;

        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(strip_etag_quotes)
            .filter(|etag| !etag.is_empty()))
    }
}
