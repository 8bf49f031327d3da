use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngestorError;
use crate::token::TokenSource;

/// Destination of a dataset transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferMethod {
    S3,
    Globus,
    ExtGlobus,
    /// Register in SciCat only
    #[default]
    None,
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferMethod::S3 => "S3",
            TransferMethod::Globus => "Globus",
            TransferMethod::ExtGlobus => "ExtGlobus",
            TransferMethod::None => "None",
        };
        f.write_str(name)
    }
}

/// Task status; the last three are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Waiting,
    Transferring,
    Finished,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Failed | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Waiting => "waiting",
            Status::Transferring => "transferring",
            Status::Finished => "finished",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One entry of a dataset's file list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Path relative to the dataset folder, `/`-separated
    pub path: String,
    pub size: u64,
    pub is_symlink: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            is_symlink: false,
            modified: None,
        }
    }
}

/// Progress and status of a task, copied out under the task lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetails {
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub files_transferred: u64,
    pub files_total: u64,
    pub status: Status,
    pub message: String,
}

impl TaskDetails {
    /// Transfer progress in percent
    ///
    /// With nothing to transfer, a task reports 0 until it is finished and
    /// 100 afterwards.
    pub fn percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return if self.status == Status::Finished { 100 } else { 0 };
        }
        let pct = self.bytes_transferred.saturating_mul(100) / self.bytes_total;
        pct.min(100) as u8
    }
}

/// Owner and archival settings forwarded to the broker on finalization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivalJobInfo {
    pub owner_user: String,
    pub owner_group: String,
    pub contact_email: String,
    pub auto_archive: bool,
}

/// Per-task auxiliary values the transfer methods need
#[derive(Clone, Default)]
pub struct TransferObjects {
    /// SciCat token of the user the dataset is ingested for
    pub scicat_token: String,
    /// Metadata supplied with the request; `metadata.json` is read when absent
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub archival: ArchivalJobInfo,
    /// Broker service token (S3)
    pub broker_token: Option<Arc<TokenSource>>,
    /// Globus transfer token; falls back to the process-wide source when absent
    pub globus_token: Option<Arc<TokenSource>>,
}

impl fmt::Debug for TransferObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferObjects")
            .field("scicat_token", &"<redacted>")
            .field("metadata", &self.metadata.as_ref().map(|m| m.len()))
            .field("archival", &self.archival)
            .field("broker_token", &self.broker_token.is_some())
            .field("globus_token", &self.globus_token.is_some())
            .finish()
    }
}

/// Outcome of one orchestrator run, inspected by the queue
#[derive(Debug)]
pub struct TaskResult {
    pub elapsed_seconds: f64,
    pub error: Option<IngestorError>,
}

/// Read-only view of a task for listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub folder: PathBuf,
    pub dataset_id: String,
    pub method: TransferMethod,
    pub details: TaskDetails,
}

impl TaskSnapshot {
    pub fn percent(&self) -> u8 {
        self.details.percent()
    }
}
