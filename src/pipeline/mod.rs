//! Pipeline stages for form-to-certificate generation.
//!
//! Each submodule implements exactly one step. Keeping stages separate makes
//! each independently testable and lets the orchestrator in
//! [`crate::generate`] own the ordering and the cleanup guarantees.
//!
//! ## Data Flow
//!
//! ```text
//! validate ──▶ upload ──▶ staging ──▶ render ──▶ (stream)
//! (fields)     (photo)    (files)     (subprocess)
//! ```
//!
//! 1. [`validate`] — presence check of the required form fields
//! 2. [`upload`]   — accept or silently drop the optional photo
//! 3. [`staging`]  — per-run directory owning every transient file
//! 4. [`render`]   — drive the external renderer over [`process`], which
//!    bounds the child in time and drains its output

pub mod process;
pub mod render;
pub mod staging;
pub mod upload;
pub mod validate;
