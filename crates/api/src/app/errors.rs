use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use aetos_infra::coordinators::ScraperError;
use aetos_infra::{IngestError, LaunchError, StoreError, TransitionError};
use aetos_lifecycle::ListingState;

pub fn transition_error_to_response(err: TransitionError) -> axum::response::Response {
    let current = err.current_state();
    let (status, code) = match &err {
        TransitionError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        TransitionError::InvalidTransition { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition")
        }
        TransitionError::MissingReason { .. } => (StatusCode::BAD_REQUEST, "missing_reason"),
        TransitionError::TransitionFailed { .. } => (StatusCode::CONFLICT, "contention"),
        TransitionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
    };
    json_error_with_state(status, code, err.to_string(), current)
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("listing not found: {id}"),
        ),
        StoreError::Invalid(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        other => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            other.to_string(),
        ),
    }
}

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match err {
        IngestError::Store(e) => store_error_to_response(e),
    }
}

pub fn scraper_error_to_response(err: ScraperError) -> axum::response::Response {
    json_error(StatusCode::BAD_GATEWAY, "scraper_error", err.to_string())
}

pub fn launch_error_to_response(err: LaunchError) -> axum::response::Response {
    match err {
        LaunchError::RotationEmpty => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "rotation_empty",
            "no brand given and no searches enabled in the rotation",
        ),
        LaunchError::Store(e) => store_error_to_response(e),
        LaunchError::Scraper(e) => scraper_error_to_response(e),
        LaunchError::Ingest(e) => ingest_error_to_response(e),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    json_error_with_state(status, code, message, None)
}

/// Like [`json_error`], adding `current_state` when it is known.
pub fn json_error_with_state(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    current_state: Option<ListingState>,
) -> axum::response::Response {
    let mut body = json!({
        "error": code,
        "message": message.into(),
    });
    if let Some(state) = current_state {
        body["current_state"] = json!(state);
    }
    (status, axum::Json(body)).into_response()
}

pub fn parse_listing_state(s: &str) -> Result<ListingState, axum::response::Response> {
    s.parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_state",
            format!(
                "state must be one of: {}",
                ListingState::ALL.map(ListingState::as_str).join(", ")
            ),
        )
    })
}
