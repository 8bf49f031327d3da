//! Dataset submission

use axum::{extract::State, http::HeaderMap, Json};
use openem_ingestor::core::collect_file_list;
use openem_ingestor::task::ArchivalJobInfo;
use openem_ingestor::{TransferMethod, TransferObjects};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::scicat_token;
use crate::collections::resolve_source_folder;
use crate::error::{WebError, WebResult};
use crate::state::AppState;

/// Keys a submitted metadata object must carry besides `sourceFolder`
const REQUIRED_KEYS: [&str; 3] = ["ownerGroup", "contactEmail", "owner"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDatasetRequest {
    /// Dataset metadata, either a JSON object or a string holding one
    pub meta_data: Value,
    /// SciCat token, used when no `Authorization` header is sent
    #[serde(default)]
    pub user_token: Option<String>,
    /// Request an archive job once the data is in place; defaults to true
    #[serde(default)]
    pub auto_archive: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDatasetResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    pub status: String,
}

/// Create a transfer task for a dataset folder and schedule it
///
/// With transfer method `None` the dataset is registered in place and the
/// response already carries its pid.
pub async fn post_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PostDatasetRequest>,
) -> WebResult<Json<PostDatasetResponse>> {
    let token = scicat_token(&headers, request.user_token.as_deref())?;
    let mut metadata = parse_metadata(request.meta_data)?;

    let source_folder = str_field(&metadata, "sourceFolder")
        .ok_or_else(|| WebError::BadRequest("sourceFolder is not present in the metadata".into()))?;
    if let Some(key) = REQUIRED_KEYS.iter().find(|k| str_field(&metadata, k).is_none()) {
        return Err(WebError::BadRequest(format!("Missing key {} in metadata", key)));
    }

    let folder = resolve_source_folder(&state.config.web_server.collection_locations, &source_folder)?;
    match tokio::fs::metadata(&folder).await {
        Ok(meta) if meta.is_dir() => {}
        _ => {
            return Err(WebError::BadRequest(format!(
                "dataset folder {} does not exist",
                folder.display()
            )))
        }
    }
    metadata.insert(
        "sourceFolder".into(),
        Value::String(folder.to_string_lossy().into_owned()),
    );

    let policy = state.config.transfer.symlink_policy;
    let walk_folder = folder.clone();
    let files = tokio::task::spawn_blocking(move || collect_file_list(&walk_folder, policy))
        .await
        .map_err(|e| WebError::Internal(format!("file listing aborted: {}", e)))??;

    let auto_archive = request.auto_archive.unwrap_or(true);
    let method = state.config.transfer.method;

    if method == TransferMethod::None {
        let registration = state
            .orchestrator
            .ingest_in_place(&folder, &files, Some(metadata), &token, auto_archive)
            .await?;
        return Ok(Json(PostDatasetResponse {
            ingest_id: None,
            dataset_id: Some(registration.pid),
            status: "finished".into(),
        }));
    }

    let archival = ArchivalJobInfo {
        owner_user: str_field(&metadata, "owner").unwrap_or_default(),
        owner_group: str_field(&metadata, "ownerGroup").unwrap_or_default(),
        contact_email: str_field(&metadata, "contactEmail").unwrap_or_default(),
        auto_archive,
    };
    let broker_token = match method {
        TransferMethod::S3 => Some(state.orchestrator.broker_token(&token).await?),
        _ => None,
    };
    let objects = TransferObjects {
        scicat_token: token,
        metadata: Some(metadata),
        archival,
        broker_token,
        globus_token: None,
    };

    let id = Uuid::new_v4();
    state.queue.add(id, folder, files, method, objects)?;
    if let Err(e) = state.queue.schedule(id).await {
        if let Err(discard) = state.queue.discard(id) {
            tracing::warn!(transfer_id = %id, error = %discard, "failed to discard unscheduled task");
        }
        return Err(e.into());
    }
    tracing::info!(transfer_id = %id, %method, "dataset ingestion started");

    Ok(Json(PostDatasetResponse {
        ingest_id: Some(id),
        dataset_id: None,
        status: "started".into(),
    }))
}

fn parse_metadata(value: Value) -> WebResult<Map<String, Value>> {
    let value = match value {
        Value::String(text) => serde_json::from_str(&text)?,
        other => other,
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(WebError::BadRequest("metaData must be a JSON object".into())),
    }
}

fn str_field(metadata: &Map<String, Value>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_as_string_or_object() {
        let map = parse_metadata(json!(r#"{"type": "raw"}"#)).unwrap();
        assert_eq!(map["type"], "raw");
        let map = parse_metadata(json!({"type": "derived"})).unwrap();
        assert_eq!(map["type"], "derived");

        assert!(matches!(parse_metadata(json!("[1, 2]")), Err(WebError::BadRequest(_))));
        assert!(matches!(parse_metadata(json!("{not json")), Err(WebError::BadRequest(_))));
    }
}
