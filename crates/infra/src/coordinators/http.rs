//! Coordinator backed by an HTTP service.
//!
//! `POST {base_url}{path}` with the listing as JSON. Status mapping:
//!
//! | Response | Outcome |
//! |----------|---------|
//! | `202 Accepted` | `Pending` (the service queued the step) |
//! | other `2xx` | `Success` |
//! | `408`, `429`, `5xx`, connection errors | `Retryable` |
//! | other `4xx` | `Terminal` |

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use aetos_core::{AggregateRoot, ListingId};
use aetos_lifecycle::{Listing, ListingState};

use super::{Coordinator, StepOutcome};

#[derive(Debug, Serialize)]
struct StepRequest<'a> {
    listing_id: ListingId,
    product_id: i64,
    brand: &'a str,
    model: &'a str,
    url: &'a str,
    title: &'a str,
    price: f64,
    state: ListingState,
    version: u64,
}

#[derive(Debug, Clone)]
pub struct HttpStepCoordinator {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpStepCoordinator {
    pub fn new(name: impl Into<String>, base_url: &str, path: &str) -> Self {
        Self::with_client(name, base_url, path, reqwest::Client::new())
    }

    pub fn with_client(
        name: impl Into<String>,
        base_url: &str,
        path: &str,
        client: reqwest::Client,
    ) -> Self {
        let endpoint = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Self {
            name: name.into(),
            endpoint,
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify(status: StatusCode, body: String) -> StepOutcome {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::ACCEPTED => StepOutcome::pending(detail),
        s if s.is_success() => StepOutcome::Success,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            StepOutcome::Retryable(detail)
        }
        s if s.is_server_error() => StepOutcome::Retryable(detail),
        _ => StepOutcome::Terminal(detail),
    }
}

#[async_trait]
impl Coordinator for HttpStepCoordinator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt_step(&self, listing: &Listing) -> StepOutcome {
        let source = listing.source();
        let request = StepRequest {
            listing_id: *listing.id(),
            product_id: listing.product_id(),
            brand: listing.brand(),
            model: listing.model(),
            url: &source.url,
            title: &source.title,
            price: source.price,
            state: listing.state(),
            version: listing.version(),
        };

        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(err) => return StepOutcome::Retryable(format!("request failed: {err}")),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(coordinator = %self.name, %status, "coordinator responded");
        classify(status, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(classify(StatusCode::OK, String::new()), StepOutcome::Success);
        assert_eq!(classify(StatusCode::CREATED, "{}".into()), StepOutcome::Success);
        assert!(matches!(
            classify(StatusCode::ACCEPTED, String::new()),
            StepOutcome::Pending { .. }
        ));
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, "bad listing".into()),
            StepOutcome::Terminal(msg) if msg.contains("bad listing")
        ));
    }

    #[test]
    fn endpoint_joins_cleanly() {
        let c = HttpStepCoordinator::new("chatterbot", "http://chatterbot:8000/", "/conversations");
        assert_eq!(c.endpoint(), "http://chatterbot:8000/conversations");
    }
}
