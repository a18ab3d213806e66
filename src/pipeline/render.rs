//! Render invocation: hand a staged record to the external renderer and
//! classify what comes back.
//!
//! ## Why the renderer is a subprocess
//!
//! The document engine is an opaque program (a headless browser driven by
//! a script, by default). It is called as
//!
//! ```text
//! <program> <args…> <record.json> <output>
//! ```
//!
//! and is considered successful only when it exits with status zero *and*
//! leaves a non-empty file at `<output>`. Exit status alone is not trusted:
//! scripts that swallow their own exceptions routinely exit zero without
//! writing anything.
//!
//! ## Why the diagnostic is stderr verbatim
//!
//! The operator needs the renderer's own words to fix a broken template.
//! The text is carried in [`RenderFailure::Exited`] and logged at `error`;
//! the HTTP layer never shows it to the submitter.

use crate::config::ServiceConfig;
use crate::pipeline::process::{run_bounded, ProcessExit, ProcessSpec};
use crate::pipeline::staging::StagedFile;
use crate::pipeline::validate::SubmissionRecord;
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// The JSON record the renderer reads.
///
/// A flat object: every validated field as a string, plus
/// `photo_filename` and `photo_path` (both `null` without an image).
#[derive(Debug, Clone)]
pub struct RenderRequest<'a> {
    record: &'a SubmissionRecord,
    photo: Option<&'a StagedFile>,
}

impl<'a> RenderRequest<'a> {
    pub fn new(record: &'a SubmissionRecord, photo: Option<&'a StagedFile>) -> Self {
        Self { record, photo }
    }

    pub fn to_value(&self) -> Value {
        let mut obj: Map<String, Value> = self
            .record
            .fields()
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let (name, path) = match self.photo {
            Some(file) => (
                Value::String(file.file_name().to_string()),
                Value::String(file.path().to_string_lossy().into_owned()),
            ),
            None => (Value::Null, Value::Null),
        };
        obj.insert("photo_filename".to_string(), name);
        obj.insert("photo_path".to_string(), path);
        Value::Object(obj)
    }

    /// Serialised bytes, ready for staging as the `input-payload`.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.to_value())
    }
}

/// Why a render produced no document.
#[derive(Debug, Clone, Error)]
pub enum RenderFailure {
    /// The renderer could not be started at all.
    #[error("could not start '{program}': {detail}")]
    Spawn { program: String, detail: String },

    /// The renderer exited with a non-zero status (or was killed by a
    /// signal, in which case `code` is `None`).
    #[error("renderer exited with {}: {diagnostic}", describe_code(*.code))]
    Exited {
        code: Option<i32>,
        diagnostic: String,
    },

    /// Exit status zero, but no usable output file.
    #[error("renderer reported success but '{}' is missing or empty", .path.display())]
    MissingOutput { path: PathBuf },

    /// Wall-clock limit exceeded; the process was killed.
    #[error("renderer exceeded {secs}s")]
    TimedOut { secs: u64 },
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}

/// Result of one renderer invocation.
#[derive(Debug, Clone)]
pub enum RenderOutcome {
    /// The reserved output file now holds the document.
    Success(StagedFile),
    Failure(RenderFailure),
}

impl RenderOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RenderOutcome::Success(_))
    }
}

/// Runs the configured renderer. Cheap to clone; holds no process state.
#[derive(Debug, Clone)]
pub struct RenderInvoker {
    program: PathBuf,
    args: Vec<OsString>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl RenderInvoker {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            program: config.renderer_program.clone(),
            args: config.renderer_args.iter().map(OsString::from).collect(),
            workdir: config.renderer_workdir.clone(),
            timeout: config.render_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Render `payload` into the reserved `output` path.
    ///
    /// Never panics and never returns `Err`: every failure mode is a
    /// [`RenderOutcome::Failure`].
    pub async fn invoke(&self, payload: &StagedFile, output: &StagedFile) -> RenderOutcome {
        let mut args = self.args.clone();
        args.push(payload.path().as_os_str().to_owned());
        args.push(output.path().as_os_str().to_owned());
        let spec = ProcessSpec {
            program: self.program.clone(),
            args,
            workdir: self.workdir.clone(),
            timeout: self.timeout,
        };

        debug!(
            "Invoking renderer {} on {}",
            self.program.display(),
            payload.file_name()
        );
        let report = match run_bounded(&spec).await {
            Ok(r) => r,
            Err(e) => {
                error!("Renderer {} failed to start: {}", self.program.display(), e);
                return RenderOutcome::Failure(RenderFailure::Spawn {
                    program: self.program.display().to_string(),
                    detail: e.to_string(),
                });
            }
        };

        match report.exit {
            ProcessExit::TimedOut => {
                error!(
                    "Renderer timed out after {:?} (limit {:?})",
                    report.elapsed, self.timeout
                );
                RenderOutcome::Failure(RenderFailure::TimedOut {
                    secs: self.timeout.as_secs(),
                })
            }
            ProcessExit::Exited(status) if !status.success() => {
                let stderr = report.stderr_text();
                let diagnostic = if stderr.is_empty() {
                    format!("exited with {}", describe_code(status.code()))
                } else {
                    stderr
                };
                error!(
                    "Renderer exited with {:?} after {:?}: {}",
                    status.code(),
                    report.elapsed,
                    diagnostic
                );
                RenderOutcome::Failure(RenderFailure::Exited {
                    code: status.code(),
                    diagnostic,
                })
            }
            ProcessExit::Exited(_) => {
                if !has_content(output.path()).await {
                    error!(
                        "Renderer exited 0 but produced no output at {}",
                        output.path().display()
                    );
                    return RenderOutcome::Failure(RenderFailure::MissingOutput {
                        path: output.path().to_path_buf(),
                    });
                }
                let stdout = report.stdout_text();
                if !stdout.is_empty() {
                    debug!("Renderer stdout: {}", stdout);
                }
                info!("Rendered {} in {:?}", output.file_name(), report.elapsed);
                RenderOutcome::Success(output.clone())
            }
        }
    }
}

async fn has_content(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
