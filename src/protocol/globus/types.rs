//! Globus Transfer API documents

use serde::{Deserialize, Serialize};

/// One file of a transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub source_path: String,
    pub destination_path: String,
    pub is_symlink: bool,
}

/// A file-list transfer between two collections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source_collection: String,
    pub destination_collection: String,
    pub label: String,
    pub items: Vec<TransferItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmitResult {
    pub code: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub message: String,
}

impl SubmitResult {
    pub fn is_accepted(&self) -> bool {
        self.code == "Accepted"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct FatalError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
}

/// The subset of a Globus task document the monitor reads
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct GlobusTask {
    pub status: String,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub files_transferred: u64,
    #[serde(default)]
    pub files: u64,
    #[serde(default)]
    pub files_skipped: Option<u64>,
    #[serde(default)]
    pub fatal_error: Option<FatalError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CancelResult {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl CancelResult {
    pub fn is_canceled(&self) -> bool {
        self.code == "Canceled"
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmissionId {
    pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "DATA_TYPE")]
pub(crate) enum TransferDataItem<'a> {
    #[serde(rename = "transfer_item")]
    File {
        source_path: &'a str,
        destination_path: &'a str,
        recursive: bool,
    },
    #[serde(rename = "transfer_symlink_item")]
    Symlink {
        source_path: &'a str,
        destination_path: &'a str,
    },
}

#[derive(Debug, Serialize)]
pub(crate) struct TransferDocument<'a> {
    #[serde(rename = "DATA_TYPE")]
    pub data_type: &'static str,
    pub submission_id: &'a str,
    pub source_endpoint: &'a str,
    pub destination_endpoint: &'a str,
    pub label: &'a str,
    pub verify_checksum: bool,
    #[serde(rename = "DATA")]
    pub data: Vec<TransferDataItem<'a>>,
}

impl<'a> TransferDocument<'a> {
    pub fn new(request: &'a TransferRequest, submission_id: &'a str) -> Self {
        let data = request
            .items
            .iter()
            .map(|item| {
                if item.is_symlink {
                    TransferDataItem::Symlink {
                        source_path: &item.source_path,
                        destination_path: &item.destination_path,
                    }
                } else {
                    TransferDataItem::File {
                        source_path: &item.source_path,
                        destination_path: &item.destination_path,
                        recursive: false,
                    }
                }
            })
            .collect();
        Self {
            data_type: "transfer",
            submission_id,
            source_endpoint: &request.source_collection,
            destination_endpoint: &request.destination_collection,
            label: &request.label,
            verify_checksum: true,
            data,
        }
    }
}
