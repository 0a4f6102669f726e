use serde::{Deserialize, Serialize};

use aetos_core::ScrapeJobId;
use aetos_infra::ScrapeBatch;
use aetos_infra::coordinators::{ScraperMatch, scrape_batch};
use aetos_lifecycle::{HistoryEntry, Listing, ListingState};

// -------------------------
// Request DTOs
// -------------------------

/// Scraper job-complete notification.
#[derive(Debug, Deserialize)]
pub struct JobCompleteNotification {
    pub job_id: ScrapeJobId,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub matches: Vec<ScraperMatch>,
}

impl From<JobCompleteNotification> for ScrapeBatch {
    fn from(n: JobCompleteNotification) -> Self {
        scrape_batch(n.job_id, n.brand, n.matches)
    }
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequestBody {
    pub to_state: String,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListingQuery {
    pub state: Option<String>,
    pub brand: Option<String>,
    pub product_id: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Both fields optional; without a brand the search rotation picks one.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerScrapeRequest {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default, alias = "search_term")]
    pub search: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobCompleteAccepted {
    pub accepted: bool,
    pub created: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct ListingPageResponse {
    pub listings: Vec<Listing>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub listing: Listing,
    pub transition: HistoryEntry,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub listing_id: String,
    pub current_state: ListingState,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub outbox_backlog: Option<u64>,
}
