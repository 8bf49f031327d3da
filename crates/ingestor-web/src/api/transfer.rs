//! Transfer listing and removal

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use openem_ingestor::task::TaskDetails;
use openem_ingestor::{Status, TaskSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::scicat_token;
use crate::error::{WebError, WebResult};
use crate::state::AppState;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferQuery {
    pub transfer_id: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub transfer_id: String,
    /// Human-readable status: `queued`, `progress: N%`, `finished` or the failure message
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dataset_ids: Vec<String>,
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferList {
    pub total: usize,
    pub transfers: Vec<TransferItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTransferRequest {
    #[serde(alias = "ingestId")]
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTransferResponse {
    pub transfer_id: Uuid,
    pub status: String,
}

/// Status line shown to the user for a task
pub fn status_text(details: &TaskDetails) -> String {
    match details.status {
        Status::Waiting => "queued".to_string(),
        Status::Transferring => format!("progress: {}%", details.percent()),
        Status::Finished => "finished".to_string(),
        Status::Failed if details.message.is_empty() => "failed - unknown error".to_string(),
        Status::Cancelled if details.message.is_empty() => "cancelled".to_string(),
        Status::Failed | Status::Cancelled => details.message.clone(),
    }
}

impl From<TaskSnapshot> for TransferItem {
    fn from(snapshot: TaskSnapshot) -> Self {
        let dataset_ids = if snapshot.dataset_id.is_empty() {
            Vec::new()
        } else {
            vec![snapshot.dataset_id.clone()]
        };
        Self {
            transfer_id: snapshot.id.to_string(),
            status: status_text(&snapshot.details),
            dataset_ids,
            percent: snapshot.percent(),
        }
    }
}

fn parse_id(raw: &str) -> WebResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| WebError::BadRequest(format!("invalid transfer id: {}", raw)))
}

/// One task by `transferId`, or a page of tasks in insertion order
pub async fn get_transfer(
    State(state): State<AppState>,
    Query(query): Query<TransferQuery>,
) -> WebResult<Json<TransferList>> {
    if let Some(raw) = query.transfer_id.as_deref() {
        let snapshot = state.queue.get(parse_id(raw)?)?;
        return Ok(Json(TransferList {
            total: 1,
            transfers: vec![snapshot.into()],
        }));
    }

    let Some(page) = query.page else {
        return Err(WebError::BadRequest("Not enough parameters".into()));
    };
    let (offset, limit) = page_window(page, query.page_size);
    let (total, snapshots) = state.queue.list(offset, limit);
    Ok(Json(TransferList {
        total,
        transfers: snapshots.into_iter().map(TransferItem::from).collect(),
    }))
}

/// Offset and limit of a 1-based page; out-of-range values are clamped
fn page_window(page: i64, page_size: Option<i64>) -> (usize, usize) {
    let page = usize::try_from(page.max(1)).unwrap_or(usize::MAX);
    let limit = match page_size {
        Some(size) if size > 0 => usize::try_from(size).unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE),
        _ => DEFAULT_PAGE_SIZE,
    };
    ((page - 1).saturating_mul(limit), limit)
}

/// Cancel a task if it is still running and forget it
pub async fn delete_transfer(
    State(state): State<AppState>,
    Json(request): Json<DeleteTransferRequest>,
) -> WebResult<Json<DeleteTransferResponse>> {
    let id = parse_id(&request.transfer_id)?;
    state.queue.remove(id)?;
    Ok(Json(DeleteTransferResponse {
        transfer_id: id,
        status: "gone".into(),
    }))
}

/// Transfers run by the external Globus service on behalf of the caller
pub async fn get_external_transfers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> WebResult<Json<TransferList>> {
    let token = scicat_token(&headers, None)?;
    let catalog = state.orchestrator.catalog();
    let user = catalog.user_info(&token).await?;
    let jobs = catalog.transfer_jobs(&token, &user.username).await?;

    let transfers: Vec<TransferItem> = jobs
        .iter()
        .map(|job| TransferItem {
            transfer_id: job.id.clone(),
            status: job.status_message(),
            dataset_ids: job.dataset_pids(),
            percent: job.percent(),
        })
        .collect();
    Ok(Json(TransferList {
        total: transfers.len(),
        transfers,
    }))
}
