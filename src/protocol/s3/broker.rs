//! Presigned-URL broker client

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{
    AbortUploadRequest, CompletePart, CompleteUploadRequest, FinalizeDatasetRequest,
    PresignedUpload, PresignedUrlRequest, PresignedUrlResponse, ServiceTokenResponse,
};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::error::{IngestorError, Result};
use crate::protocol::check_status;
use crate::token::TokenSnapshot;

/// Operations of the presigned-URL broker
///
/// Every call except `service_token` is authorized with the broker access
/// token of the task.
#[async_trait]
pub trait PresignedUrlBroker: Send + Sync {
    /// Request `parts` presigned PUT URLs; `parts > 1` also opens a multipart upload
    async fn presigned_urls(
        &self,
        access_token: &str,
        object_name: &str,
        parts: u64,
    ) -> Result<PresignedUpload>;

    async fn complete_upload(
        &self,
        access_token: &str,
        object_name: &str,
        upload_id: &str,
        parts: &[CompletePart],
        checksum_sha256: &str,
    ) -> Result<()>;

    async fn abort_multipart_upload(
        &self,
        access_token: &str,
        object_name: &str,
        upload_id: &str,
    ) -> Result<()>;

    async fn finalize_dataset_upload(
        &self,
        access_token: &str,
        request: &FinalizeDatasetRequest,
    ) -> Result<()>;

    /// Exchange a SciCat user token for a broker access/refresh token pair
    async fn service_token(&self, user_token: &str) -> Result<TokenSnapshot>;
}

/// HTTP implementation of [`PresignedUrlBroker`]
#[derive(Debug, Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl BrokerClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestorError::Config(format!("failed to build broker client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    /// POST `body` with retry on transient failures, returning the successful response
    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        bearer: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let url = url.as_str();
        let http = &self.http;
        // Not bound to a task: aborts run after the task was cancelled
        let never = CancellationToken::new();

        with_retry(&self.retry, &never, path, || async move {
            let response = http
                .post(url)
                .bearer_auth(bearer)
                .json(body)
                .send()
                .await?;
            check_status("broker", response).await
        })
        .await
    }

    async fn post_json<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        bearer: &str,
        body: &B,
    ) -> Result<R> {
        let response = self.post(path, bearer, body).await?;
        response.json::<R>().await.map_err(|e| {
            IngestorError::Serialization(format!("invalid broker response to {}: {}", path, e))
        })
    }
}

#[async_trait]
impl PresignedUrlBroker for BrokerClient {
    async fn presigned_urls(
        &self,
        access_token: &str,
        object_name: &str,
        parts: u64,
    ) -> Result<PresignedUpload> {
        debug!(object_name, parts, "requesting presigned URLs");
        let response: PresignedUrlResponse = self
            .post_json(
                "presignedUrls",
                access_token,
                &PresignedUrlRequest { object_name, parts },
            )
            .await?;
        Ok(response.into())
    }

    async fn complete_upload(
        &self,
        access_token: &str,
        object_name: &str,
        upload_id: &str,
        parts: &[CompletePart],
        checksum_sha256: &str,
    ) -> Result<()> {
        let request = CompleteUploadRequest {
            object_name,
            upload_id,
            parts,
            checksum_sha256,
        };
        match self.post("completeUpload", access_token, &request).await {
            Ok(_) => Ok(()),
            // A rejected completion means the parts or checksum did not match
            Err(IngestorError::Upstream {
                status, details, ..
            }) if (400..500).contains(&status) && status != 429 => Err(IngestorError::Integrity(
                format!("multipart completion rejected (HTTP {}): {}", status, details),
            )),
            Err(e) => Err(e),
        }
    }

    async fn abort_multipart_upload(
        &self,
        access_token: &str,
        object_name: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.post(
            "abortMultipartUpload",
            access_token,
            &AbortUploadRequest {
                object_name,
                upload_id,
            },
        )
        .await
        .map(|_| ())
    }

    async fn finalize_dataset_upload(
        &self,
        access_token: &str,
        request: &FinalizeDatasetRequest,
    ) -> Result<()> {
        self.post("finalizeDatasetUpload", access_token, request)
            .await
            .map(|_| ())
    }

    async fn service_token(&self, user_token: &str) -> Result<TokenSnapshot> {
        let response: ServiceTokenResponse = self
            .post_json("serviceToken", user_token, &serde_json::json!({}))
            .await
            .map_err(|e| match e {
                IngestorError::Upstream { status, details, .. } if status == 401 || status == 403 => {
                    IngestorError::Auth(format!("service token denied: {}", details))
                }
                other => other,
            })?;

        let lifetime = chrono::Duration::seconds(response.expires_in.unwrap_or(300));
        Ok(TokenSnapshot::new(
            response.access_token,
            response.refresh_token,
            Utc::now() + lifetime,
        ))
    }
}
