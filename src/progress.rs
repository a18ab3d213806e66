//! Observer trait for pipeline state transitions.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::ServiceConfigBuilder::observer`] to receive every state
//! change of every run. The CLI drives its spinner from it; tests use it to
//! check the state machine.
//!
//! # Example
//!
//! ```rust
//! use certpress::{PipelineObserver, RunState, ServiceConfig};
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Default)]
//! struct Recorder {
//!     states: Mutex<Vec<RunState>>,
//! }
//!
//! impl PipelineObserver for Recorder {
//!     fn on_transition(&self, _run_id: &str, _from: RunState, to: RunState) {
//!         self.states.lock().unwrap().push(to);
//!     }
//! }
//!
//! let config = ServiceConfig::builder()
//!     .observer(Arc::new(Recorder::default()) as Arc<dyn PipelineObserver>)
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::upload::RejectReason;
use serde::Serialize;
use std::fmt;

/// Lifecycle of one pipeline run.
///
/// ```text
/// Received ─▶ Validated ─▶ Staged ─▶ Rendering ─▶ Succeeded ─┐
///    │            │          │           │                    ├─▶ Cleaned
///    └────────────┴──────────┴───────────┴──▶ Failed ─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Received,
    Validated,
    Staged,
    Rendering,
    Succeeded,
    Failed,
    Cleaned,
}

impl RunState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Validated, Staged)
                | (Staged, Rendering)
                | (Rendering, Succeeded)
                | (Received | Validated | Staged | Rendering, Failed)
                | (Succeeded | Failed, Cleaned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Cleaned)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Received => "received",
            RunState::Validated => "validated",
            RunState::Staged => "staged",
            RunState::Rendering => "rendering",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// Called by the pipeline as each run moves through its states.
///
/// Runs execute concurrently, so implementations must be `Send + Sync` and
/// guard shared state themselves. All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    /// Called on every state change, including the final `Cleaned`.
    fn on_transition(&self, run_id: &str, from: RunState, to: RunState) {
        let _ = (run_id, from, to);
    }

    /// Called when an attached file was not accepted as the certificate photo.
    fn on_upload_rejected(&self, run_id: &str, reason: &RejectReason) {
        let _ = (run_id, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        use RunState::*;
        let path = [Received, Validated, Staged, Rendering, Succeeded, Cleaned];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn any_active_state_can_fail() {
        use RunState::*;
        for s in [Received, Validated, Staged, Rendering] {
            assert!(s.can_advance_to(Failed), "{s} -> failed");
        }
        assert!(!Succeeded.can_advance_to(Failed));
    }

    #[test]
    fn cleaned_only_after_terminal_outcome() {
        use RunState::*;
        assert!(!Rendering.can_advance_to(Cleaned));
        assert!(!Received.can_advance_to(Cleaned));
        assert!(Failed.can_advance_to(Cleaned));
        assert!(Cleaned.is_terminal());
        assert!(!Cleaned.can_advance_to(Received));
    }
}
