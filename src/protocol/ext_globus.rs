//! External Globus transfer service
//!
//! The service runs the Globus transfer on the ingestor's behalf and records
//! its progress as a SciCat job; the ingestor only requests and cancels.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IngestorError, Result};
use crate::task::{FileEntry, Status};

/// Header carrying the SciCat token on requests to the transfer service
pub const SCICAT_KEY_HEADER: &str = "SciCat-API-Key";

#[async_trait]
pub trait ExternalTransferService: Send + Sync {
    /// Request a transfer of `files` for dataset `pid`, returning the job id
    async fn request_transfer(
        &self,
        scicat_token: &str,
        source_facility: &str,
        destination_facility: &str,
        pid: &str,
        files: &[FileEntry],
    ) -> Result<String>;

    /// Cancel a job; `delete` also removes its SciCat job entry
    async fn cancel_transfer(&self, scicat_token: &str, job_id: &str, delete: bool) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileToTransfer<'a> {
    path: &'a str,
    is_symlink: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferBody<'a> {
    file_list: Vec<FileToTransfer<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferResponse {
    job_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// HTTP client of the external transfer service
#[derive(Debug, Clone)]
pub struct ExtGlobusClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExtGlobusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                IngestorError::Config(format!("failed to build transfer service client: {}", e))
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let parsed: ServiceError = serde_json::from_str(&body).unwrap_or_default();
        Err(IngestorError::Upstream {
            service: "transfer service".into(),
            status: status.as_u16(),
            message: parsed
                .message
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
            details: parsed.details.unwrap_or(body),
        })
    }
}

#[async_trait]
impl ExternalTransferService for ExtGlobusClient {
    async fn request_transfer(
        &self,
        scicat_token: &str,
        source_facility: &str,
        destination_facility: &str,
        pid: &str,
        files: &[FileEntry],
    ) -> Result<String> {
        let body = TransferBody {
            file_list: files
                .iter()
                .map(|f| FileToTransfer {
                    path: &f.path,
                    is_symlink: f.is_symlink,
                })
                .collect(),
        };
        debug!(pid, files = files.len(), "requesting external transfer");

        let response = self
            .http
            .post(format!("{}/transfer", self.base_url))
            .query(&[
                ("sourceFacility", source_facility),
                ("destFacility", destination_facility),
                ("scicatPid", pid),
            ])
            .header(SCICAT_KEY_HEADER, scicat_token)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let parsed: TransferResponse = response.json().await.map_err(|e| {
            IngestorError::Serialization(format!("invalid transfer service response: {}", e))
        })?;
        info!(pid, job_id = %parsed.job_id, "external transfer requested");
        Ok(parsed.job_id)
    }

    async fn cancel_transfer(&self, scicat_token: &str, job_id: &str, delete: bool) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/transfer/{}", self.base_url, job_id))
            .query(&[("delete", delete)])
            .header(SCICAT_KEY_HEADER, scicat_token)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }
}

/// Result object the transfer service writes into its SciCat job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobResult {
    pub globus_task_id: String,
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub files_total: u64,
    pub completed: bool,
    pub error: String,
}

/// A `globus_transfer_job` as stored in SciCat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScicatJob {
    pub id: String,
    pub owner_user: String,
    pub status_code: String,
    pub status_message: String,
    pub job_params: serde_json::Value,
    pub job_result_object: JobResult,
}

impl ScicatJob {
    /// Pids of the datasets the job transfers
    pub fn dataset_pids(&self) -> Vec<String> {
        self.job_params
            .get("datasetList")
            .and_then(|list| list.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|d| d.get("pid").and_then(|p| p.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn status(&self) -> Status {
        let result = &self.job_result_object;
        if !result.error.is_empty() {
            Status::Failed
        } else if result.completed {
            Status::Finished
        } else if result.globus_task_id.is_empty() {
            Status::Waiting
        } else {
            Status::Transferring
        }
    }

    pub fn percent(&self) -> u8 {
        let result = &self.job_result_object;
        if result.completed && result.error.is_empty() {
            return 100;
        }
        if result.files_total == 0 {
            return 0;
        }
        (result.files_transferred.min(result.files_total) * 100 / result.files_total) as u8
    }

    /// Human-readable status line
    pub fn status_message(&self) -> String {
        match self.status() {
            Status::Waiting => "queued".to_string(),
            Status::Transferring => format!("transferring {}%", self.percent()),
            Status::Finished => "finished".to_string(),
            _ => format!("failed: {}", self.job_result_object.error),
        }
    }
}
