//! Response streaming: turn a finished run into what the requester sees.
//!
//! ## Why read the document into memory?
//!
//! The retention policy is stream-and-delete: once the renderer's output
//! has been read, the staged file is released immediately, before the
//! response is written. A client that stalls mid-download therefore
//! never pins a file on disk. Certificates are a few hundred KiB, well
//! under the upload ceiling, so buffering is cheap.
//!
//! ## Why a separate failure notice?
//!
//! [`CertError`] carries raw detail (paths, renderer stderr) meant for
//! operators. [`FailureNotice`] maps it to a stable code, an HTTP status
//! and a message that is safe to show to whoever filled in the form.

use crate::config::ServiceConfig;
use crate::error::CertError;
use crate::output::CertificateDocument;
use crate::pipeline::staging::{StagedFile, StagingArea};
use crate::pipeline::validate::SubmissionRecord;
use crate::sanitize::download_filename;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

/// Seconds a client is told to wait after [`CertError::Busy`].
pub const BUSY_RETRY_AFTER_SECS: u64 = 5;

/// Read the rendered document into memory and release its staged file.
///
/// The output is released whether or not the read succeeds.
pub async fn collect_document(
    area: &mut StagingArea,
    output: &StagedFile,
    record: &SubmissionRecord,
    config: &ServiceConfig,
    render_ms: u64,
) -> Result<CertificateDocument, CertError> {
    let read = tokio::fs::read(output.path()).await;
    if let Err(e) = area.release(output) {
        warn!("{}", e);
    }
    let bytes = read.map_err(|e| CertError::staging(output.path(), e))?;

    let filename = download_filename(record.child_name(), &config.output_extension);
    debug!("Collected {} ({} bytes)", filename, bytes.len());
    Ok(CertificateDocument {
        filename,
        content_type: content_type_for(&config.output_extension),
        bytes,
        run_id: area.run_id().to_string(),
        render_ms,
    })
}

/// MIME type for a rendered document extension.
pub fn content_type_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "html" | "htm" => "text/html; charset=utf-8",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

impl IntoResponse for CertificateDocument {
    fn into_response(self) -> Response {
        let disposition = format!("attachment; filename=\"{}\"", self.filename);
        let mut response = (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, self.content_type.to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            self.bytes,
        )
            .into_response();
        if let Ok(v) = HeaderValue::from_str(&self.run_id) {
            response.headers_mut().insert("x-run-id", v);
        }
        response
    }
}

/// Public face of a failed run.
#[derive(Debug, Clone, Serialize)]
pub struct FailureNotice {
    /// Stable machine-readable code (see [`CertError::code`]).
    pub code: &'static str,
    /// Message safe to show the submitter.
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
    /// Seconds to wait before retrying, for capacity failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&CertError> for FailureNotice {
    fn from(err: &CertError) -> Self {
        let (status, message) = match err {
            CertError::Validation { field } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Missing required field: {field}"),
            ),
            CertError::PayloadTooLarge { limit } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "The submission is too large (limit {} MB).",
                    limit / (1024 * 1024)
                ),
            ),
            CertError::MalformedRequest { .. } => (
                StatusCode::BAD_REQUEST,
                "The submission could not be read.".to_string(),
            ),
            CertError::Render(_) => (
                StatusCode::BAD_GATEWAY,
                "The certificate could not be generated. Please try again later.".to_string(),
            ),
            CertError::RenderTimeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                "Generating the certificate took too long and was cancelled.".to_string(),
            ),
            CertError::Busy { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "The service is busy. Please try again in a moment.".to_string(),
            ),
            CertError::Staging { .. } | CertError::InvalidConfig(_) | CertError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred. Please try again.".to_string(),
            ),
        };
        let retry_after = matches!(err, CertError::Busy { .. }).then_some(BUSY_RETRY_AFTER_SECS);
        Self {
            code: err.code(),
            message,
            status,
            retry_after,
        }
    }
}

impl FailureNotice {
    /// Attach `Retry-After` to `response` when this notice carries one.
    pub fn decorate(&self, mut response: Response) -> Response {
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl IntoResponse for FailureNotice {
    fn into_response(self) -> Response {
        let response = (self.status, Json(&self)).into_response();
        self.decorate(response)
    }
}
