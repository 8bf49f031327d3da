//! Error types for the HTTP API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openem_ingestor::error::ErrorCategory;
use openem_ingestor::IngestorError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WebError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl WebError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WebError::NotFound(_) => StatusCode::NOT_FOUND,
            WebError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<IngestorError> for WebError {
    fn from(err: IngestorError) -> Self {
        let message = err.to_string();
        match err {
            IngestorError::TaskNotFound(_) => WebError::NotFound(message),
            IngestorError::TaskExists(_) => WebError::BadRequest(message),
            _ => match err.category() {
                ErrorCategory::Auth => WebError::Unauthorized(message),
                ErrorCategory::Preflight => WebError::BadRequest(message),
                _ => WebError::Internal(message),
            },
        }
    }
}

impl From<serde_json::Error> for WebError {
    fn from(err: serde_json::Error) -> Self {
        WebError::BadRequest(format!("invalid JSON: {}", err))
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type WebResult<T> = Result<T, WebError>;
