//! SciCat REST client

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{
    ArchiveJobRequest, CreatedDataset, OrigDatablock, SelfResponse, UserIdentity, UserInfo,
};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::error::{IngestorError, Result};
use crate::protocol::check_status;
use crate::protocol::ext_globus::ScicatJob;

/// Job type written by the external transfer service
pub const GLOBUS_TRANSFER_JOB: &str = "globus_transfer_job";

/// The SciCat operations the ingestor depends on
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn user_info(&self, token: &str) -> Result<UserInfo>;

    /// Create a dataset and return its pid
    async fn create_dataset(&self, token: &str, metadata: &Map<String, Value>) -> Result<String>;

    async fn create_orig_datablock(&self, token: &str, block: &OrigDatablock) -> Result<()>;

    /// Flag the dataset's files as available for archiving
    async fn mark_files_ready(&self, token: &str, pid: &str) -> Result<()>;

    async fn create_archive_job(&self, token: &str, job: &ArchiveJobRequest) -> Result<()>;

    /// `Ok` when SciCat reports itself healthy
    async fn health(&self) -> Result<()>;

    /// Globus transfer jobs owned by `owner_user`
    async fn transfer_jobs(&self, token: &str, owner_user: &str) -> Result<Vec<ScicatJob>>;
}

/// HTTP implementation of [`Catalog`]
#[derive(Debug, Clone)]
pub struct ScicatClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl ScicatClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestorError::Config(format!("failed to build scicat client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// GET with retry on transient failures
    async fn get_json<R: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<R> {
        let url = self.url(path);
        let url = url.as_str();
        let http = &self.http;
        let never = CancellationToken::new();

        let response = with_retry(&self.retry, &never, path, || async move {
            let response = http.get(url).bearer_auth(token).query(query).send().await?;
            check_status("scicat", response).await
        })
        .await?;
        decode(path, response).await
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .request(method, self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        check_status("scicat", response).await
    }
}

async fn decode<R: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<R> {
    response.json::<R>().await.map_err(|e| {
        IngestorError::Serialization(format!("invalid scicat response to {}: {}", path, e))
    })
}

#[async_trait]
impl Catalog for ScicatClient {
    async fn user_info(&self, token: &str) -> Result<UserInfo> {
        if token.is_empty() {
            return Err(IngestorError::Auth("scicat: no access token was provided".into()));
        }
        let me: SelfResponse = self
            .get_json("users/my/self", token, &[])
            .await
            .map_err(|e| {
                let denied = matches!(e, IngestorError::Upstream { status: 401 | 403, .. });
                if denied {
                    IngestorError::Auth(format!("scicat: couldn't get user info from token: {}", e))
                } else {
                    e
                }
            })?;

        let filter = json!({"where": {"userId": me.id}}).to_string();
        let identity: UserIdentity = self
            .get_json("useridentities/findOne", token, &[("filter", filter)])
            .await?;

        let profile = identity.profile;
        let username = if profile.username.is_empty() {
            me.username
        } else {
            profile.username
        };
        let info = UserInfo {
            display_name: if profile.display_name.is_empty() {
                username.clone()
            } else {
                profile.display_name
            },
            email: if profile.email.is_empty() {
                me.email
            } else {
                profile.email
            },
            username,
            access_groups: profile.access_groups,
        };
        debug!(user = %info.username, groups = info.access_groups.len(), "resolved scicat user");
        Ok(info)
    }

    async fn create_dataset(&self, token: &str, metadata: &Map<String, Value>) -> Result<String> {
        if !metadata.contains_key("type") {
            return Err(IngestorError::Preflight(
                "Failed to create new dataset: metadata has no \"type\"".into(),
            ));
        }
        let response = self
            .send_json(reqwest::Method::POST, "datasets", token, metadata)
            .await
            .map_err(|e| e.context("Failed to create new dataset"))?;
        let created: CreatedDataset = decode("datasets", response).await?;
        info!(pid = %created.pid, "dataset created");
        Ok(created.pid)
    }

    async fn create_orig_datablock(&self, token: &str, block: &OrigDatablock) -> Result<()> {
        self.send_json(reqwest::Method::POST, "OrigDatablocks", token, block)
            .await
            .map_err(|e| e.context("Failed to create original datablock"))?;
        Ok(())
    }

    async fn mark_files_ready(&self, token: &str, pid: &str) -> Result<()> {
        let path = format!("datasets/{}", utf8_percent_encode(pid, NON_ALPHANUMERIC));
        let body = json!({
            "datasetlifecycle": {
                "archivable": true,
                "archiveStatusMessage": "datasetCreated",
            }
        });
        self.send_json(reqwest::Method::PATCH, &path, token, &body)
            .await
            .map_err(|e| e.context("Failed to mark dataset files as ready"))?;
        Ok(())
    }

    async fn create_archive_job(&self, token: &str, job: &ArchiveJobRequest) -> Result<()> {
        self.send_json(reqwest::Method::POST, "jobs", token, job)
            .await
            .map_err(|e| e.context("Failed to create archive job"))?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let response = self.http.get(self.url("health")).send().await?;
        match response.status().as_u16() {
            200..=299 => Ok(()),
            503 => Err(IngestorError::upstream("scicat", 503, "health check failed")),
            _ => check_status("scicat", response).await.map(|_| ()),
        }
    }

    async fn transfer_jobs(&self, token: &str, owner_user: &str) -> Result<Vec<ScicatJob>> {
        let filter = json!({"where": {"type": GLOBUS_TRANSFER_JOB, "ownerUser": owner_user}})
            .to_string();
        self.get_json("jobs", token, &[("filter", filter)]).await
    }
}
