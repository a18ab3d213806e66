//! Route handlers.

use super::flash::{FlashMessage, FlashSigner, FLASH_COOKIE};
use super::AppState;
use crate::error::CertError;
use crate::pipeline::upload::ImageUpload;
use crate::pipeline::validate::Submission;
use crate::stream::FailureNotice;
use crate::templates::{render_form_page, PHOTO_FIELD};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use serde::Serialize;
use tracing::debug;

const SUCCESS_TEXT: &str = "Adoption certificate generated successfully!";

/// `GET /`
pub async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let flash = state.flash.read(&headers);
    let page = Html(render_form_page(flash.as_ref()));
    if has_flash_cookie(&headers) {
        ([(header::SET_COOKIE, FlashSigner::clear_cookie())], page).into_response()
    } else {
        page.into_response()
    }
}

/// `POST /submit`
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let wants_json = accepts_json(&headers);
    let limit = state.pipeline.config().max_upload_bytes;

    let submission = match multipart {
        Ok(mp) => read_submission(mp, limit).await,
        Err(rejection) => Err(CertError::MalformedRequest {
            detail: rejection.body_text(),
        }),
    };
    let submission = match submission {
        Ok(s) => s,
        Err(e) => return failure_response(&state, &e, wants_json),
    };

    // A detached task keeps the run (and its cleanup) going if the client
    // disconnects and this handler future is dropped.
    let pipeline = state.pipeline.clone();
    let result = tokio::spawn(async move { pipeline.generate(submission).await })
        .await
        .unwrap_or_else(|e| Err(CertError::Internal(format!("pipeline task failed: {e}"))));

    match result {
        Ok(document) if wants_json => document.into_response(),
        // The banner shows on the browser's next visit to the form.
        Ok(document) => {
            let cookie = state.flash.set_cookie(&FlashMessage::success(SUCCESS_TEXT));
            ([(header::SET_COOKIE, cookie)], document).into_response()
        }
        Err(e) => failure_response(&state, &e, wants_json),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub render_slots_available: usize,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
        render_slots_available: state.pipeline.available_render_slots(),
    })
}

/// Drain the multipart body into a [`Submission`].
///
/// Text fields keep their first value. The first `orphan_photo` part is the
/// image; an empty file input still arrives as a part and is passed on for
/// the upload guard to reject.
async fn read_submission(mut multipart: Multipart, limit: usize) -> Result<Submission, CertError> {
    let mut submission = Submission::new();
    let mut total = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == PHOTO_FIELD {
            let filename = field.file_name().map(str::to_string);
            let bytes = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
            total += bytes.len();
            if submission.image.is_none() {
                submission.image = Some(ImageUpload {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
        } else {
            let text = field.text().await.map_err(|e| multipart_error(e, limit))?;
            total += name.len() + text.len();
            submission.fields.entry(name).or_insert(text);
        }
        if total > limit {
            return Err(CertError::PayloadTooLarge { limit });
        }
    }

    debug!(
        "Read submission: {} field(s), photo={}",
        submission.fields.len(),
        submission.image.is_some()
    );
    Ok(submission)
}

fn multipart_error(err: MultipartError, limit: usize) -> CertError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        CertError::PayloadTooLarge { limit }
    } else {
        CertError::MalformedRequest {
            detail: err.body_text(),
        }
    }
}

/// JSON body for API clients; otherwise back to the form with a flash
/// message. `Busy` keeps its 503 either way.
fn failure_response(state: &AppState, err: &CertError, wants_json: bool) -> Response {
    let notice = FailureNotice::from(err);
    if wants_json {
        return notice.into_response();
    }
    let flash = FlashMessage::error(notice.message.clone());
    if matches!(err, CertError::Busy { .. }) {
        let page = (notice.status, Html(render_form_page(Some(&flash)))).into_response();
        return notice.decorate(page);
    }
    (
        [(header::SET_COOKIE, state.flash.set_cookie(&flash))],
        Redirect::to("/"),
    )
        .into_response()
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

fn has_flash_cookie(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(FLASH_COOKIE))
}
