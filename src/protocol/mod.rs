//! Transfer back ends
//!
//! - [`s3`]: chunked uploads through a presigned-URL broker
//! - [`globus`]: Globus transfer submission and monitoring
//! - [`ext_globus`]: hand-off to an external Globus transfer service

pub mod ext_globus;
pub mod globus;
pub mod s3;

use crate::error::{IngestorError, Result};

/// Map non-2xx responses of `service` to [`IngestorError::Upstream`]
pub(crate) async fn check_status(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IngestorError::Upstream {
        service: service.to_string(),
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
        details: body,
    })
}
