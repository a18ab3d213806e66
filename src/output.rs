//! Output types returned by a successful run.

use serde::Serialize;
use std::fmt;

/// A rendered certificate, held in memory after its staged file has been
/// released.
#[derive(Clone, Serialize)]
pub struct CertificateDocument {
    /// Attachment name, e.g. `adoption_certificate_Amal.pdf`.
    pub filename: String,
    /// MIME type derived from the output extension.
    pub content_type: &'static str,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Identifier of the run that produced the document.
    pub run_id: String,
    /// Wall-clock time spent in the renderer.
    pub render_ms: u64,
}

impl CertificateDocument {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for CertificateDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateDocument")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("bytes", &self.bytes.len())
            .field("run_id", &self.run_id)
            .field("render_ms", &self.render_ms)
            .finish()
    }
}
