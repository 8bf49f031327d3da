//! HTTP API handlers

pub mod dataset;
pub mod system;
pub mod transfer;

pub use dataset::{post_dataset, PostDatasetRequest, PostDatasetResponse};
pub use system::{get_health, get_version, HealthInfo, VersionInfo};
pub use transfer::{
    delete_transfer, get_external_transfers, get_transfer, DeleteTransferRequest,
    DeleteTransferResponse, TransferItem, TransferList,
};

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::error::{WebError, WebResult};

/// SciCat token of the caller: the `Authorization: Bearer` header, else `fallback`
pub(crate) fn scicat_token(headers: &HeaderMap, fallback: Option<&str>) -> WebResult<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    from_header
        .or(fallback.filter(|t| !t.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| WebError::Unauthorized("no SciCat token was provided".into()))
}
