//! Upload guard: decide whether an attached file becomes the certificate
//! photo, and stage it under a collision-resistant name.
//!
//! A certificate without a photo is a valid submission, so nothing here is
//! an error: an absent, unnamed, mistyped or empty attachment is simply
//! [`UploadDecision::Rejected`] and the run continues without an image.

use crate::config::ServiceConfig;
use crate::error::CertError;
use crate::pipeline::staging::{ArtifactRole, StagedFile, StagingArea};
use crate::sanitize::{extension_of, secure_filename, stem_of};
use chrono::Local;
use image::ImageFormat;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Process-wide disambiguator appended to the timestamp prefix.
static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// An attachment as received from the client.
#[derive(Clone, Default)]
pub struct ImageUpload {
    /// Client-supplied file name; `None` or empty when the form field was
    /// left blank.
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageUpload")
            .field("filename", &self.filename)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl ImageUpload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: Some(filename.into()),
            bytes: bytes.into(),
        }
    }
}

/// Why an attachment was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// No file part in the submission.
    Absent,
    /// File part present but without a name.
    Unnamed,
    /// Zero-byte file.
    Empty,
    /// Extension missing or outside the allow-set.
    DisallowedExtension(Option<String>),
    /// Bytes do not look like a PNG, JPEG or GIF.
    UnrecognisedContent,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Absent => f.write_str("no file attached"),
            RejectReason::Unnamed => f.write_str("file has no name"),
            RejectReason::Empty => f.write_str("file is empty"),
            RejectReason::DisallowedExtension(Some(ext)) => {
                write!(f, "extension '.{ext}' is not allowed")
            }
            RejectReason::DisallowedExtension(None) => f.write_str("file has no extension"),
            RejectReason::UnrecognisedContent => f.write_str("content is not a supported image"),
        }
    }
}

/// An attachment that passed the guard, with its staging name.
#[derive(Debug, Clone)]
pub struct AcceptedImage {
    pub staged_name: String,
    pub extension: String,
    pub bytes: Vec<u8>,
}

/// Outcome of [`screen`].
#[derive(Debug, Clone)]
pub enum UploadDecision {
    Accepted(AcceptedImage),
    Rejected(RejectReason),
}

/// Apply the type/size policy to an optional attachment.
///
/// Accepts only a named, non-empty file whose extension is in
/// [`ServiceConfig::allowed_extensions`] and, when
/// [`ServiceConfig::verify_image_content`] is set, whose leading bytes
/// sniff as PNG, JPEG or GIF.
pub fn screen(upload: Option<&ImageUpload>, config: &ServiceConfig) -> UploadDecision {
    let Some(upload) = upload else {
        return UploadDecision::Rejected(RejectReason::Absent);
    };
    let original = match upload.filename.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => return UploadDecision::Rejected(RejectReason::Unnamed),
    };
    let extension = match extension_of(original) {
        Some(ext) if config.is_allowed_extension(&ext) => ext,
        other => return UploadDecision::Rejected(RejectReason::DisallowedExtension(other)),
    };
    if upload.bytes.is_empty() {
        return UploadDecision::Rejected(RejectReason::Empty);
    }
    if config.verify_image_content && !looks_like_image(&upload.bytes) {
        return UploadDecision::Rejected(RejectReason::UnrecognisedContent);
    }

    let staged_name = unique_name(original, &extension);
    debug!("Accepted upload '{}' as '{}'", original, staged_name);
    UploadDecision::Accepted(AcceptedImage {
        staged_name,
        extension,
        bytes: upload.bytes.clone(),
    })
}

/// Write an accepted image into the run's staging area.
pub async fn stage_image(
    area: &mut StagingArea,
    image: &AcceptedImage,
) -> Result<StagedFile, CertError> {
    area.stage_bytes(ArtifactRole::InputImage, &image.staged_name, &image.bytes)
        .await
}

/// Longest stem kept from the original name. With the 30-byte prefix and
/// an allowed extension the result stays far below the usual 255-byte
/// filename limit.
const MAX_STEM_BYTES: usize = 100;

/// `<YYYYmmdd_HHMMSS_micros>_<seq>_<sanitised stem>.<ext>`.
///
/// The timestamp keeps names sortable; the sequence number makes two
/// uploads of the same file in the same microsecond distinct. Long stems
/// are cut to [`MAX_STEM_BYTES`].
pub fn unique_name(original: &str, extension: &str) -> String {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let stem = secure_filename(stem_of(original));
    // ASCII only after sanitising, so any byte index is a char boundary.
    let stem = stem[..stem.len().min(MAX_STEM_BYTES)].trim_end_matches(['.', '_']);
    let stem = if stem.is_empty() { "upload" } else { stem };
    format!(
        "{}_{:06}_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S_%6f"),
        seq % 1_000_000,
        stem,
        extension
    )
}

fn looks_like_image(bytes: &[u8]) -> bool {
    matches!(
        image::guess_format(bytes),
        Ok(ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif)
    )
}
