use axum::Router;

pub mod admin;
pub mod system;
pub mod webhooks;

/// Router for the webhook and admin surfaces.
pub fn router() -> Router {
    Router::new()
        .nest("/webhooks", webhooks::router())
        .nest("/admin", admin::router())
}
