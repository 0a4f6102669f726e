use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use aetos_core::{ListingId, ScrapeJobId};
use aetos_infra::store::{ListingFilter, NewRotationEntry};
use aetos_infra::TransitionRequest;
use aetos_lifecycle::Trigger;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/listings", get(list_listings))
        .route("/listings/:id", get(get_listing))
        .route("/listings/:id/history", get(listing_history))
        .route("/listings/:id/transition", post(transition_listing))
        .route("/scrape/trigger", post(trigger_scrape))
        .route("/scrape/:job_id/status", get(scrape_status))
        .route("/rotation", get(list_rotation).post(add_rotation_entry))
        .route("/dispatch", get(dispatch_log))
}

fn parse_listing_id(id: &str) -> Result<ListingId, axum::response::Response> {
    id.parse().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid listing id")
    })
}

pub async fn list_listings(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListingQuery>,
) -> axum::response::Response {
    let state = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => match errors::parse_listing_state(s) {
            Ok(state) => Some(state),
            Err(resp) => return resp,
        },
        None => None,
    };

    let filter = ListingFilter {
        state,
        brand: query.brand.filter(|b| !b.trim().is_empty()),
        product_id: query.product_id,
        limit: query.limit.unwrap_or(ListingFilter::DEFAULT_LIMIT),
        offset: query.offset.unwrap_or(0),
    }
    .normalized();
    let (limit, offset) = (filter.limit, filter.offset);

    match services.store.search(filter).await {
        Ok(page) => Json(dto::ListingPageResponse {
            listings: page.listings,
            total: page.total,
            limit,
            offset,
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_listing(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_listing_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.store.get(id).await {
        Ok(listing) => Json(listing).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn listing_history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_listing_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let listing = match services.store.get(id).await {
        Ok(l) => l,
        Err(e) => return errors::store_error_to_response(e),
    };
    match services.store.history(id).await {
        Ok(history) => Json(dto::HistoryResponse {
            listing_id: id.to_string(),
            current_state: listing.state(),
            history,
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Operator-initiated transition. Always attributed to the admin trigger, so a
/// non-blank reason is required.
pub async fn transition_listing(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::TransitionRequestBody>,
) -> axum::response::Response {
    let id = match parse_listing_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let to_state = match errors::parse_listing_state(&body.to_state) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let mut request = TransitionRequest::new(id, to_state, Trigger::Admin);
    if let Some(reason) = body.reason {
        request = request.with_reason(reason);
    }

    let entry = match services.engine.transition(request).await {
        Ok(e) => e,
        Err(e) => return errors::transition_error_to_response(e),
    };

    match services.store.get(id).await {
        Ok(listing) => Json(dto::TransitionResponse {
            listing,
            transition: entry,
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Start a scrape. An empty body, or one without a brand, uses the next
/// search in the rotation.
pub async fn trigger_scrape(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let request: dto::TriggerScrapeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        dto::TriggerScrapeRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string())
            }
        }
    };

    match services
        .launcher
        .launch(request.brand.as_deref(), request.search.as_deref())
        .await
    {
        Ok(launched) => (StatusCode::ACCEPTED, Json(launched)).into_response(),
        Err(e) => errors::launch_error_to_response(e),
    }
}

pub async fn scrape_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id: ScrapeJobId = match job_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid scrape job id")
        }
    };
    match services.launcher.scraper().job_status(job_id).await {
        Ok(ticket) => Json(ticket).into_response(),
        Err(e) => errors::scraper_error_to_response(e),
    }
}

pub async fn list_rotation(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.store.rotation().await {
        Ok(entries) => Json(json!({ "entries": entries })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn add_rotation_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Json(entry): Json<NewRotationEntry>,
) -> axum::response::Response {
    if entry.brand.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "brand is required");
    }
    match services.store.add_rotation_entry(entry).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn dispatch_log(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    Json(json!({
        "stats": services.dispatcher.stats(),
        "records": services.dispatcher.dispatch_log(),
    }))
    .into_response()
}
