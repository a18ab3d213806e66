//! # certpress
//!
//! Turn a web form submission into a certificate document by way of an
//! external renderer, without leaving anything behind on disk.
//!
//! ## Why this crate?
//!
//! The rendering itself is someone else's problem: a headless browser, a
//! script, any program that reads a JSON record and writes a document. What
//! is easy to get wrong is everything around it: uploaded photos with
//! hostile names, a renderer that hangs or floods its stderr, concurrent
//! requests trampling each other's temp files, and transient files that
//! survive a crash. This crate owns that part.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Submission
//!  │
//!  ├─ 1. Validate  required fields present (no I/O yet)
//!  ├─ 2. Slot      wait for one of N render slots
//!  ├─ 3. Screen    accept or silently drop the photo
//!  ├─ 4. Stage     per-run directory: photo, record.json, reserved output
//!  ├─ 5. Render    <program> <args…> record.json output, bounded in time
//!  ├─ 6. Collect   read the document, release the output
//!  └─ 7. Cleanup   release everything, on every path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use certpress::{CertificatePipeline, ServiceConfig, Submission};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder()
//!         .renderer("node", ["html-to-pdf.js"])
//!         .build()?;
//!     let pipeline = CertificatePipeline::new(config)?;
//!     let submission = Submission::new()
//!         .with_field("child_name", "Amal")
//!         .with_field("guardian_name", "Huda")
//!         .with_field("birthday", "2016-04-02")
//!         .with_field("child_id", "C-104")
//!         .with_field("child_phone", "555-0101")
//!         .with_field("location", "Irbid")
//!         .with_field("donor_name", "J. Smith")
//!         .with_field("donor_phone", "555-0199")
//!         .with_field("address", "12 Elm St")
//!         .with_field("month", "2024-06")
//!         .with_field("amount", "40");
//!     let doc = pipeline.generate(submission).await?;
//!     std::fs::write(&doc.filename, &doc.bytes)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `certpress` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when embedding the pipeline or router in another service:
//! ```toml
//! certpress = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod generate;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod sanitize;
pub mod server;
pub mod stream;
pub mod templates;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use error::{CertError, CleanupError};
pub use generate::CertificatePipeline;
pub use output::CertificateDocument;
pub use pipeline::render::{RenderFailure, RenderOutcome};
pub use pipeline::upload::{ImageUpload, RejectReason};
pub use pipeline::validate::{Submission, SubmissionRecord, REQUIRED_FIELDS};
pub use progress::{PipelineObserver, RunState};
pub use server::{router, serve, AppState};
pub use stream::FailureNotice;
