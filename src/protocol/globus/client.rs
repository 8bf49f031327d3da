//! Globus Transfer API client

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{
    CancelResult, GlobusTask, SubmissionId, SubmitResult, TransferDocument, TransferRequest,
};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::error::{IngestorError, Result};
use crate::protocol::check_status;

/// The Globus Transfer operations used by the ingestor
#[async_trait]
pub trait GlobusApi: Send + Sync {
    async fn submit_transfer(&self, access_token: &str, request: &TransferRequest)
        -> Result<SubmitResult>;

    async fn get_task(&self, access_token: &str, task_id: &str) -> Result<GlobusTask>;

    async fn cancel_task(&self, access_token: &str, task_id: &str) -> Result<CancelResult>;
}

/// HTTP implementation of [`GlobusApi`]
#[derive(Debug, Clone)]
pub struct GlobusClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl GlobusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestorError::Config(format!("failed to build globus client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// Shared HTTP client, also used for the Globus token refresher
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str, token: &str) -> Result<R> {
        let url = format!("{}/{}", self.base_url, path);
        let url = url.as_str();
        let http = &self.http;
        let never = CancellationToken::new();

        let response = with_retry(&self.retry, &never, path, || async move {
            let response = http.get(url).bearer_auth(token).send().await?;
            check_status("globus", response).await
        })
        .await?;
        decode(path, response).await
    }

    async fn post_json<B, R>(&self, path: &str, token: &str, body: &B) -> Result<R>
    where
        B: serde::Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let response = check_status("globus", response).await?;
        decode(path, response).await
    }
}

async fn decode<R: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<R> {
    response.json::<R>().await.map_err(|e| {
        IngestorError::Serialization(format!("invalid globus response to {}: {}", path, e))
    })
}

#[async_trait]
impl GlobusApi for GlobusClient {
    async fn submit_transfer(
        &self,
        access_token: &str,
        request: &TransferRequest,
    ) -> Result<SubmitResult> {
        // The submission id makes the submit idempotent, so only its fetch is retried
        let submission: SubmissionId = self.get_json("submission_id", access_token).await?;
        debug!(
            label = %request.label,
            items = request.items.len(),
            "submitting globus transfer"
        );
        let document = TransferDocument::new(request, &submission.value);
        self.post_json("transfer", access_token, &document).await
    }

    async fn get_task(&self, access_token: &str, task_id: &str) -> Result<GlobusTask> {
        self.get_json(&format!("task/{}", task_id), access_token)
            .await
    }

    async fn cancel_task(&self, access_token: &str, task_id: &str) -> Result<CancelResult> {
        self.post_json(
            &format!("task/{}/cancel", task_id),
            access_token,
            &serde_json::json!({}),
        )
        .await
    }
}
