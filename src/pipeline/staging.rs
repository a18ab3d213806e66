//! Artifact staging: the sole owner of every transient file in a run.
//!
//! ## Why one directory per run?
//!
//! Concurrent runs share only the staging root. Giving each run a private
//! [`TempDir`] with a random suffix means runs can never see, overwrite or
//! delete each other's files, without any locking. File names inside the
//! directory only need to be unique within the run.
//!
//! ## Release discipline
//!
//! Every [`StagedFile`] handed out is tracked. [`StagingArea::release`] is
//! idempotent; [`StagingArea::release_all`] removes whatever is still live
//! and the directory itself. If the area is dropped with live files (early
//! return, panic, cancelled future), `Drop` performs the same release, so
//! no exit path leaks files.

use crate::error::{CertError, CleanupError};
use serde::Serialize;
use std::ffi::OsStr;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// What a staged file is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactRole {
    /// The submitted photo.
    InputImage,
    /// The JSON record handed to the renderer.
    InputPayload,
    /// The document written by the renderer.
    OutputDocument,
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactRole::InputImage => "input-image",
            ArtifactRole::InputPayload => "input-payload",
            ArtifactRole::OutputDocument => "output-document",
        })
    }
}

/// Handle to a file owned by a [`StagingArea`].
///
/// Holding a handle does not keep the file alive; only the area decides
/// when it is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    id: usize,
    role: ArtifactRole,
    path: PathBuf,
}

impl StagedFile {
    pub fn role(&self) -> ArtifactRole {
        self.role
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Path allocated; some other party may create the file.
    Reserved,
    /// We wrote the file ourselves.
    Materialized,
    Released,
}

#[derive(Debug)]
struct Entry {
    file: StagedFile,
    state: EntryState,
}

/// Per-run owner of transient files.
pub struct StagingArea {
    run_id: String,
    dir: Option<TempDir>,
    dir_path: PathBuf,
    entries: Vec<Entry>,
}

impl fmt::Debug for StagingArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingArea")
            .field("run_id", &self.run_id)
            .field("dir", &self.dir_path)
            .field("live", &self.live_count())
            .finish()
    }
}

impl StagingArea {
    /// Allocate a private directory for `run_id` under `root`.
    pub fn open(root: &Path, run_id: &str) -> Result<Self, CertError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("run-{run_id}-"))
            .tempdir_in(root)
            .map_err(|e| CertError::staging(root, e))?;
        let dir_path = dir.path().to_path_buf();
        debug!("Opened staging area {}", dir_path.display());
        Ok(Self {
            run_id: run_id.to_string(),
            dir: Some(dir),
            dir_path,
            entries: Vec::new(),
        })
    }

    /// The run's private directory.
    pub fn dir(&self) -> &Path {
        &self.dir_path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write `bytes` to a new file called `name` and track it.
    ///
    /// The file is created exclusively; an existing file is never
    /// overwritten.
    pub async fn stage_bytes(
        &mut self,
        role: ArtifactRole,
        name: &str,
        bytes: &[u8],
    ) -> Result<StagedFile, CertError> {
        let file = self.allocate(role, name)?;

        let mut handle = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file.path)
            .await
            .map_err(|e| CertError::staging(&file.path, e))?;
        // Track before writing so a failed write is still cleaned up.
        self.entries.push(Entry {
            file: file.clone(),
            state: EntryState::Materialized,
        });
        handle
            .write_all(bytes)
            .await
            .map_err(|e| CertError::staging(&file.path, e))?;
        handle
            .flush()
            .await
            .map_err(|e| CertError::staging(&file.path, e))?;

        debug!("Staged {} ({} bytes) at {}", role, bytes.len(), file.path.display());
        Ok(file)
    }

    /// Allocate and track a path that another party (the renderer) will
    /// create.
    pub fn reserve(&mut self, role: ArtifactRole, name: &str) -> Result<StagedFile, CertError> {
        let file = self.allocate(role, name)?;
        self.entries.push(Entry {
            file: file.clone(),
            state: EntryState::Reserved,
        });
        debug!("Reserved {} at {}", role, file.path.display());
        Ok(file)
    }

    fn allocate(&self, role: ArtifactRole, name: &str) -> Result<StagedFile, CertError> {
        if self.dir.is_none() {
            return Err(CertError::Internal(format!(
                "staging area for run {} is already closed",
                self.run_id
            )));
        }
        let is_plain = !name.is_empty()
            && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
        if !is_plain {
            return Err(CertError::Internal(format!(
                "refusing to stage non-flat file name '{name}'"
            )));
        }
        if role == ArtifactRole::OutputDocument
            && self
                .entries
                .iter()
                .any(|e| e.file.role == role && e.state != EntryState::Released)
        {
            return Err(CertError::Internal(format!(
                "run {} already has a live output document",
                self.run_id
            )));
        }
        if self
            .entries
            .iter()
            .any(|e| e.file.path.file_name() == Some(OsStr::new(name)))
        {
            return Err(CertError::staging(
                self.dir_path.join(name),
                std::io::Error::from(ErrorKind::AlreadyExists),
            ));
        }
        Ok(StagedFile {
            id: self.entries.len(),
            role,
            path: self.dir_path.join(name),
        })
    }

    /// Remove one file. Idempotent: already released, never materialised,
    /// or foreign handles are a no-op.
    pub fn release(&mut self, file: &StagedFile) -> Result<(), CleanupError> {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.file.id == file.id && e.file.path == file.path)
        else {
            debug!("Ignoring release of foreign file {}", file.path.display());
            return Ok(());
        };
        if entry.state == EntryState::Released {
            return Ok(());
        }
        entry.state = EntryState::Released;
        remove_if_present(&entry.file)
    }

    /// Release every live file, then remove the run directory.
    ///
    /// Returns the cleanup failures; the area is closed either way.
    pub fn release_all(&mut self) -> Vec<CleanupError> {
        let mut errors = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::Released {
                continue;
            }
            entry.state = EntryState::Released;
            if let Err(e) = remove_if_present(&entry.file) {
                errors.push(e);
            }
        }
        if let Some(dir) = self.dir.take() {
            if let Err(source) = dir.close() {
                errors.push(CleanupError {
                    target: "staging directory".to_string(),
                    path: self.dir_path.clone(),
                    source,
                });
            }
        }
        errors
    }

    /// Number of tracked files not yet released.
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state != EntryState::Released)
            .count()
    }

    pub fn is_live(&self, file: &StagedFile) -> bool {
        self.entries
            .iter()
            .any(|e| e.file == *file && e.state != EntryState::Released)
    }

    /// Whether the run directory has been removed.
    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.dir.is_none() {
            return;
        }
        let live = self.live_count();
        if live > 0 {
            debug!(
                "Staging area for run {} dropped with {} live file(s); releasing",
                self.run_id, live
            );
        }
        for e in self.release_all() {
            warn!("{}", e);
        }
    }
}

fn remove_if_present(file: &StagedFile) -> Result<(), CleanupError> {
    match std::fs::remove_file(&file.path) {
        Ok(()) => {
            debug!("Released {} {}", file.role, file.path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CleanupError {
            target: file.role.to_string(),
            path: file.path.clone(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> TempDir {
        TempDir::new().expect("temp root")
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn stage_and_release() {
        let root = root();
        let mut area = StagingArea::open(root.path(), "t1").unwrap();
        let f = area
            .stage_bytes(ArtifactRole::InputPayload, "record.json", b"{}")
            .await
            .unwrap();
        assert!(f.path().exists());
        assert!(f.path().starts_with(area.dir()));
        assert_eq!(area.live_count(), 1);

        area.release(&f).unwrap();
        assert!(!f.path().exists());
        assert_eq!(area.live_count(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let root = root();
        let mut area = StagingArea::open(root.path(), "t2").unwrap();
        let f = area
            .stage_bytes(ArtifactRole::InputImage, "a.png", b"x")
            .await
            .unwrap();
        area.release(&f).unwrap();
        area.release(&f).unwrap();
        assert!(area.release_all().is_empty());
        assert!(area.release_all().is_empty());
    }

    #[test]
    fn releasing_unmaterialised_reservation_is_noop() {
        let root = root();
        let mut area = StagingArea::open(root.path(), "t3").unwrap();
        let out = area.reserve(ArtifactRole::OutputDocument, "out.pdf").unwrap();
        assert!(!out.path().exists());
        area.release(&out).unwrap();
        assert_eq!(area.live_count(), 0);
    }

    #[tokio::test]
    async fn release_all_removes_renderer_output_and_directory() {
        let root = root();
        let mut area = StagingArea::open(root.path(), "t4").unwrap();
        let out = area.reserve(ArtifactRole::OutputDocument, "out.pdf").unwrap();
        std::fs::write(out.path(), b"%PDF-1.7").unwrap();
        let dir = area.dir().to_path_buf();

        assert!(area.release_all().is_empty());
        assert!(!out.path().exists());
        assert!(!dir.exists());
        assert!(area.is_closed());
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn drop_releases_everything() {
        let root = root();
        let path = {
            let mut area = StagingArea::open(root.path(), "t5").unwrap();
            let f = area
                .stage_bytes(ArtifactRole::InputImage, "p.png", b"x")
                .await
                .unwrap();
            f.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn only_one_live_output_document() {
        let root = root();
        let mut area = StagingArea::open(root.path(), "t6").unwrap();
        let first = area.reserve(ArtifactRole::OutputDocument, "a.pdf").unwrap();
        assert!(area.reserve(ArtifactRole::OutputDocument, "b.pdf").is_err());
        area.release(&first).unwrap();
        assert!(area.reserve(ArtifactRole::OutputDocument, "c.pdf").is_ok());
    }

    #[test]
    fn rejects_nested_names() {
        let root = root();
        let mut area = StagingArea::open(root.path(), "t7").unwrap();
        assert!(area.reserve(ArtifactRole::InputImage, "../escape.png").is_err());
        assert!(area.reserve(ArtifactRole::InputImage, "a/b.png").is_err());
        assert!(area.reserve(ArtifactRole::InputImage, "").is_err());
    }

    #[tokio::test]
    async fn duplicate_names_are_refused() {
        let root = root();
        let mut area = StagingArea::open(root.path(), "t8").unwrap();
        area.stage_bytes(ArtifactRole::InputImage, "p.png", b"1")
            .await
            .unwrap();
        let err = area
            .stage_bytes(ArtifactRole::InputImage, "p.png", b"2")
            .await
            .unwrap_err();
        assert!(matches!(err, CertError::Staging { .. }));
    }

    #[tokio::test]
    async fn foreign_handles_are_ignored() {
        let root = root();
        let mut a = StagingArea::open(root.path(), "ta").unwrap();
        let mut b = StagingArea::open(root.path(), "tb").unwrap();
        let fa = a
            .stage_bytes(ArtifactRole::InputPayload, "r.json", b"{}")
            .await
            .unwrap();
        b.release(&fa).unwrap();
        assert!(fa.path().exists(), "b must not delete a's file");
        assert!(a.is_live(&fa));
    }

    #[test]
    fn open_fails_for_missing_root() {
        let root = root();
        let missing = root.path().join("nope");
        let err = StagingArea::open(&missing, "t9").unwrap_err();
        assert!(matches!(err, CertError::Staging { .. }));
    }
}
