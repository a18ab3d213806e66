//! Error types for the certpress library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`CertError`] — **Fatal for one run**: the certificate cannot be
//!   produced (missing field, renderer crashed or hung, staging I/O failed).
//!   Returned as `Err(CertError)` from
//!   [`crate::generate::CertificatePipeline::generate`].
//!
//! * [`CleanupError`] — **Non-fatal**: a transient file could not be
//!   removed. The staging area reports it and the orchestrator logs it, but
//!   it never replaces the primary outcome of the run.
//!
//! A rejected upload is neither: it is an ordinary
//! [`crate::pipeline::upload::UploadDecision::Rejected`] and the submission
//! proceeds without an image.

use crate::pipeline::render::RenderFailure;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors a pipeline run can end with.
#[derive(Debug, Error)]
pub enum CertError {
    // ── Request errors (user-correctable) ─────────────────────────────────
    /// A required form field is absent from the submission.
    #[error("Missing required field: {field}")]
    Validation { field: String },

    /// The submission exceeds the configured request ceiling.
    #[error("Submission exceeds the {limit}-byte upload limit")]
    PayloadTooLarge { limit: usize },

    /// The request body could not be parsed as a form submission.
    #[error("Malformed submission: {detail}")]
    MalformedRequest { detail: String },

    // ── Operational errors ────────────────────────────────────────────────
    /// Allocating or writing a transient file failed (disk full, permissions).
    #[error("Failed to stage '{path}': {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external renderer failed: bad exit status, no output, or could
    /// not be started.
    #[error("Render failed: {0}")]
    Render(RenderFailure),

    /// The external renderer exceeded the wall-clock limit and was killed.
    #[error("Renderer timed out after {secs}s and was terminated")]
    RenderTimeout { secs: u64 },

    /// No render slot became free within the queue timeout.
    #[error("All render slots busy; gave up after {waited_ms}ms")]
    Busy { waited_ms: u64 },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CertError {
    /// Stable machine-readable code, used in JSON error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CertError::Validation { .. } => "validation_error",
            CertError::PayloadTooLarge { .. } => "payload_too_large",
            CertError::MalformedRequest { .. } => "malformed_request",
            CertError::Staging { .. } => "staging_error",
            CertError::Render(_) => "render_error",
            CertError::RenderTimeout { .. } => "render_timeout",
            CertError::Busy { .. } => "busy",
            CertError::InvalidConfig(_) => "invalid_config",
            CertError::Internal(_) => "internal_error",
        }
    }

    /// True for failures the submitter can fix by changing the submission.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CertError::Validation { .. }
                | CertError::PayloadTooLarge { .. }
                | CertError::MalformedRequest { .. }
        )
    }

    pub(crate) fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CertError::Staging {
            path: path.into(),
            source,
        }
    }
}

impl From<RenderFailure> for CertError {
    fn from(failure: RenderFailure) -> Self {
        match failure {
            RenderFailure::TimedOut { secs } => CertError::RenderTimeout { secs },
            other => CertError::Render(other),
        }
    }
}

/// A transient file or directory could not be removed.
///
/// Reported by [`crate::pipeline::staging::StagingArea::release`] and
/// [`crate::pipeline::staging::StagingArea::release_all`]; logged by the
/// orchestrator and otherwise ignored.
#[derive(Debug, Error)]
#[error("Failed to release {target} '{path}': {source}")]
pub struct CleanupError {
    /// Role of the artifact, or `"staging directory"`.
    pub target: String,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}
