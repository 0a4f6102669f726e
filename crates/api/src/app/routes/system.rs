use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use tracing::warn;

use crate::app::dto::HealthResponse;
use crate::app::services::AppServices;

/// Liveness plus store reachability. A degraded store still answers 200.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let reachable = match services.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "store health check failed");
            false
        }
    };
    let backlog = if reachable {
        services.store.outbox_backlog().await.ok()
    } else {
        None
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: if reachable { "healthy" } else { "degraded" },
            store: services.backend,
            outbox_backlog: backlog,
        }),
    )
        .into_response()
}
