use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use tracing::info;

use aetos_infra::ScrapeBatch;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/scraper/job-complete", post(job_complete))
}

/// Scraper job-complete notification. Safe to repeat: matches that already
/// exist are counted as skipped.
pub async fn job_complete(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::JobCompleteNotification>,
) -> axum::response::Response {
    let batch = ScrapeBatch::from(body);
    let job_id = batch.job_id;

    let outcome = match services.ingestion.ingest_batch(batch).await {
        Ok(o) => o,
        Err(e) => return errors::ingest_error_to_response(e),
    };

    info!(%job_id, created = outcome.created, skipped = outcome.skipped, "job-complete accepted");
    (
        StatusCode::ACCEPTED,
        Json(dto::JobCompleteAccepted {
            accepted: true,
            created: outcome.created,
            skipped: outcome.skipped,
        }),
    )
        .into_response()
}
