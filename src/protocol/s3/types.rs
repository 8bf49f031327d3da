//! Wire types of the presigned-URL broker

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct PresignedUrlRequest<'a> {
    pub object_name: &'a str,
    pub parts: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PresignedUrlResponse {
    #[serde(rename = "uploadID", default)]
    pub upload_id: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Upload id and presigned URLs, one per part in part order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload {
    /// Empty for single-URL responses
    pub upload_id: String,
    pub urls: Vec<String>,
}

impl From<PresignedUrlResponse> for PresignedUpload {
    fn from(r: PresignedUrlResponse) -> Self {
        Self {
            upload_id: r.upload_id,
            urls: r.urls,
        }
    }
}

/// One uploaded part as reported to `completeUpload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePart {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ChecksumSHA256")]
    pub checksum_sha256: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CompleteUploadRequest<'a> {
    pub object_name: &'a str,
    #[serde(rename = "uploadID")]
    pub upload_id: &'a str,
    pub parts: &'a [CompletePart],
    #[serde(rename = "checksumSHA256")]
    pub checksum_sha256: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct AbortUploadRequest<'a> {
    pub object_name: &'a str,
    #[serde(rename = "uploadID")]
    pub upload_id: &'a str,
}

/// Body of `finalizeDatasetUpload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeDatasetRequest {
    #[serde(rename = "datasetPID")]
    pub dataset_pid: String,
    pub owner_user: String,
    pub owner_group: String,
    pub contact_email: String,
    pub create_archiving_job: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}
