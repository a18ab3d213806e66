//! Thin HTTP adapter over [`CertificatePipeline`].
//!
//! Three routes:
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET /` | the form, with any pending flash message |
//! | `POST /submit` | multipart submission → certificate attachment |
//! | `GET /health` | liveness plus free render slots |
//!
//! Everything interesting happens in the pipeline; this module only moves
//! bytes between HTTP and [`crate::pipeline::validate::Submission`].

pub mod flash;
pub mod handlers;

use crate::config::ServiceConfig;
use crate::error::CertError;
use crate::generate::CertificatePipeline;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use flash::FlashSigner;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Bytes allowed on top of `max_upload_bytes` for multipart framing, so
/// the precise ceiling is enforced by the pipeline rather than by a
/// truncated body.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared state for every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub pipeline: Arc<CertificatePipeline>,
    pub flash: FlashSigner,
    pub version: &'static str,
}

impl AppState {
    pub fn new(pipeline: CertificatePipeline) -> Self {
        let flash = FlashSigner::new(&pipeline.config().flash_secret);
        Self {
            pipeline: Arc::new(pipeline),
            flash,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Build the router for `state`.
pub fn router(state: AppState) -> Router {
    let body_limit = state
        .pipeline
        .config()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/", get(handlers::index))
        .route("/submit", post(handlers::submit))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `config.bind_addr` and serve until Ctrl-C or SIGTERM.
///
/// In-flight requests finish before this returns; their runs clean up
/// after themselves.
pub async fn serve(config: ServiceConfig) -> Result<(), CertError> {
    let addr = config.bind_addr;
    let state = AppState::new(CertificatePipeline::new(config)?);
    let app = router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CertError::Internal(format!("cannot bind {addr}: {e}")))?;
    info!("certpress listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CertError::Internal(format!("server error: {e}")))?;

    info!("certpress shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
