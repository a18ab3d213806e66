//! Pipeline orchestration: one submission in, one certificate (or one
//! error) out, and nothing left on disk either way.
//!
//! ## Why a semaphore and not a lock?
//!
//! Renders are slow (a headless browser per run) but independent. Runs only
//! share the staging root, and per-run directories make that safe, so there
//! is nothing to lock. What does need bounding is how many renderer
//! processes exist at once; a [`Semaphore`] with `max_concurrent_renders`
//! permits does exactly that, and waiting on it with a timeout gives the
//! caller a clean [`CertError::Busy`] instead of an unbounded queue.
//!
//! ## Why the cleanup is guaranteed
//!
//! Every transient file belongs to the run's [`StagingArea`]. The
//! orchestrator calls [`StagingArea::release_all`] on every exit path, and
//! if the future is dropped mid-flight (client disconnect, shutdown) the
//! area's `Drop` and the child's `kill_on_drop` do the same work. The
//! [`RunTracker`] likewise emits the final `Cleaned` state from `Drop`.

use crate::config::ServiceConfig;
use crate::error::CertError;
use crate::output::CertificateDocument;
use crate::pipeline::render::{RenderInvoker, RenderOutcome, RenderRequest};
use crate::pipeline::staging::{ArtifactRole, StagingArea};
use crate::pipeline::upload::{self, UploadDecision};
use crate::pipeline::validate::{validate, Submission};
use crate::progress::{PipelineObserver, RunState};
use crate::stream::collect_document;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Name of the staged JSON record inside a run directory.
const PAYLOAD_NAME: &str = "record.json";

/// Stem of the reserved output file inside a run directory.
const OUTPUT_STEM: &str = "certificate";

/// Reusable, cheaply shareable certificate generator.
///
/// Wrap it in an [`Arc`] and call [`generate`](Self::generate) from as many
/// tasks as you like; concurrency is bounded internally.
#[derive(Debug)]
pub struct CertificatePipeline {
    config: Arc<ServiceConfig>,
    invoker: RenderInvoker,
    render_slots: Arc<Semaphore>,
}

impl CertificatePipeline {
    /// Create a pipeline, making sure the staging root exists.
    ///
    /// # Errors
    /// [`CertError::Staging`] if the staging root cannot be created.
    pub fn new(config: ServiceConfig) -> Result<Self, CertError> {
        std::fs::create_dir_all(&config.staging_root)
            .map_err(|e| CertError::staging(&config.staging_root, e))?;
        info!(
            "Certificate pipeline ready: renderer={} slots={} timeout={}s staging={}",
            config.renderer_program.display(),
            config.max_concurrent_renders,
            config.render_timeout_secs,
            config.staging_root.display()
        );
        Ok(Self {
            invoker: RenderInvoker::from_config(&config),
            render_slots: Arc::new(Semaphore::new(config.max_concurrent_renders)),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Render slots not currently held by a run.
    pub fn available_render_slots(&self) -> usize {
        self.render_slots.available_permits()
    }

    /// Turn one submission into a certificate document.
    ///
    /// # Errors
    /// Any [`CertError`]; the run's transient files are released before
    /// this returns regardless.
    pub async fn generate(&self, submission: Submission) -> Result<CertificateDocument, CertError> {
        let run_id = Uuid::new_v4().simple().to_string();
        let span = info_span!("certificate_run", run_id = %run_id);
        self.run(run_id, submission).instrument(span).await
    }

    async fn run(&self, run_id: String, submission: Submission) -> Result<CertificateDocument, CertError> {
        let start = Instant::now();
        info!("Run started");
        let mut tracker = RunTracker::new(&run_id, self.config.observer.clone());
        let mut area: Option<StagingArea> = None;

        let result = self
            .execute(&run_id, &submission, &mut tracker, &mut area)
            .await;

        match &result {
            Ok(doc) => {
                tracker.advance(RunState::Succeeded);
                info!(
                    "Certificate ready: {} ({} bytes, render {}ms, total {}ms)",
                    doc.filename,
                    doc.len(),
                    doc.render_ms,
                    start.elapsed().as_millis()
                );
            }
            Err(e) => {
                tracker.advance(RunState::Failed);
                if e.is_user_error() {
                    info!("Run rejected: {}", e);
                } else {
                    error!("Run failed: {}", e);
                }
            }
        }

        // ── Cleanup (every exit path) ────────────────────────────────────
        if let Some(mut area) = area {
            for e in area.release_all() {
                warn!("{}", e);
            }
        }
        tracker.advance(RunState::Cleaned);
        result
    }

    async fn execute(
        &self,
        run_id: &str,
        submission: &Submission,
        tracker: &mut RunTracker,
        area: &mut Option<StagingArea>,
    ) -> Result<CertificateDocument, CertError> {
        let config = &*self.config;

        // ── Step 1: Ceiling and field validation (no I/O yet) ────────────
        let size = submission.payload_size();
        if size > config.max_upload_bytes {
            return Err(CertError::PayloadTooLarge {
                limit: config.max_upload_bytes,
            });
        }
        let record = validate(submission)?;
        tracker.advance(RunState::Validated);
        debug!("Validated {} fields ({} bytes)", record.fields().len(), size);

        // ── Step 2: Wait for a render slot ───────────────────────────────
        let permit = self.acquire_slot().await?;

        // ── Step 3: Screen the optional photo ────────────────────────────
        let accepted = match upload::screen(submission.image.as_ref(), config) {
            UploadDecision::Accepted(img) => Some(img),
            UploadDecision::Rejected(reason) => {
                debug!("Continuing without photo: {}", reason);
                if let Some(obs) = &config.observer {
                    obs.on_upload_rejected(run_id, &reason);
                }
                None
            }
        };

        // ── Step 4: Stage inputs, reserve output ─────────────────────────
        let staging = area.insert(StagingArea::open(&config.staging_root, run_id)?);
        let photo = match &accepted {
            Some(img) => Some(upload::stage_image(staging, img).await?),
            None => None,
        };
        let payload_bytes = RenderRequest::new(&record, photo.as_ref())
            .to_json()
            .map_err(|e| CertError::Internal(format!("render payload: {e}")))?;
        let payload = staging
            .stage_bytes(ArtifactRole::InputPayload, PAYLOAD_NAME, &payload_bytes)
            .await?;
        let output = staging.reserve(
            ArtifactRole::OutputDocument,
            &format!("{}.{}", OUTPUT_STEM, config.output_extension),
        )?;
        tracker.advance(RunState::Staged);

        // ── Step 5: Render ───────────────────────────────────────────────
        tracker.advance(RunState::Rendering);
        let render_start = Instant::now();
        let outcome = self.invoker.invoke(&payload, &output).await;
        let render_ms = render_start.elapsed().as_millis() as u64;
        drop(permit);

        // Inputs have served their purpose whatever the outcome.
        for input in photo.iter().chain(std::iter::once(&payload)) {
            if let Err(e) = staging.release(input) {
                warn!("{}", e);
            }
        }

        // ── Step 6: Collect the document ─────────────────────────────────
        match outcome {
            RenderOutcome::Success(document) => {
                collect_document(staging, &document, &record, config, render_ms).await
            }
            RenderOutcome::Failure(failure) => Err(failure.into()),
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, CertError> {
        let wait = self.config.queue_timeout();
        let start = Instant::now();
        let slots = Arc::clone(&self.render_slots);

        let permit = if wait.is_zero() {
            slots.try_acquire_owned().ok()
        } else {
            match tokio::time::timeout(wait, slots.acquire_owned()).await {
                Ok(Ok(p)) => Some(p),
                Ok(Err(_)) => {
                    return Err(CertError::Internal("render slots closed".into()));
                }
                Err(_) => None,
            }
        };

        let waited_ms = start.elapsed().as_millis() as u64;
        match permit {
            Some(p) => {
                if waited_ms > 0 {
                    debug!("Acquired render slot after {}ms", waited_ms);
                }
                Ok(p)
            }
            None => {
                warn!("No render slot free after {}ms", waited_ms);
                Err(CertError::Busy { waited_ms })
            }
        }
    }
}

/// Tracks one run's [`RunState`], logging and reporting every transition.
///
/// Dropping a tracker that has not reached `Cleaned` (cancelled run)
/// finishes the state machine through `Failed`.
struct RunTracker {
    run_id: String,
    state: RunState,
    observer: Option<Arc<dyn PipelineObserver>>,
}

impl RunTracker {
    fn new(run_id: &str, observer: Option<Arc<dyn PipelineObserver>>) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: RunState::Received,
            observer,
        }
    }

    fn advance(&mut self, next: RunState) {
        let from = self.state;
        if !from.can_advance_to(next) {
            debug!("Ignoring transition {} -> {}", from, next);
            return;
        }
        self.state = next;
        debug!("State {} -> {}", from, next);
        if let Some(obs) = &self.observer {
            obs.on_transition(&self.run_id, from, next);
        }
    }
}

impl Drop for RunTracker {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.advance(RunState::Failed);
        self.advance(RunState::Cleaned);
    }
}
