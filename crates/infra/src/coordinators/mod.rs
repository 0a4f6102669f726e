//! Coordinators: the boundary to external services that carry a listing through
//! a lifecycle step.
//!
//! Coordinators are never called from inside the transition engine. The
//! [`dispatch`] worker reacts to committed state changes and calls them.

pub mod circuit_breaker;
pub mod dispatch;
pub mod http;
pub mod pending;
pub mod scraper;

use async_trait::async_trait;
use serde::Serialize;

use aetos_lifecycle::Listing;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use dispatch::{
    CoordinatorDispatcher, DispatchConfig, DispatchError, DispatchHandle, DispatchRecord,
    DispatchResolution, DispatchStats,
};
pub use http::HttpStepCoordinator;
pub use pending::PendingCoordinator;
pub use scraper::{
    JobPhase, MatchedListing, MatchedProduct, ScrapeJobResult, ScrapeJobTicket, ScraperClient,
    ScraperError, ScraperMatch, scrape_batch,
};

/// Result of one coordinator attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The external service accepted the step.
    Success,
    /// Nothing can happen yet; the listing stays parked in its state.
    Pending { reason: String },
    /// A transient failure; the attempt may be repeated.
    Retryable(String),
    /// The step can never succeed for this listing.
    Terminal(String),
}

impl StepOutcome {
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepOutcome::Retryable(_))
    }
}

/// One external service that performs a lifecycle step.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Stable name, recorded as `coordinator:<name>` on transitions it causes.
    fn name(&self) -> &str;

    async fn attempt_step(&self, listing: &Listing) -> StepOutcome;
}
