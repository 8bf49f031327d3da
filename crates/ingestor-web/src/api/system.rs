//! Version and health endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthInfo {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: openem_ingestor::VERSION.to_string(),
        server: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Healthy while SciCat answers its health check
pub async fn get_health(State(state): State<AppState>) -> (StatusCode, Json<HealthInfo>) {
    match state.orchestrator.catalog().health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthInfo {
                status: "ok".into(),
                message: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "scicat health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthInfo {
                    status: "error".into(),
                    message: Some(e.to_string()),
                }),
            )
        }
    }
}
