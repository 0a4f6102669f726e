//! HTTP client for the scraper service.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument};

use aetos_core::ScrapeJobId;

use crate::ingestion::{ScrapeBatch, ScrapeMatch};

/// One product match as the scraper reports it, in job results and in the
/// job-complete notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperMatch {
    pub listing: MatchedListing,
    pub product: MatchedProduct,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub potential_profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedListing {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedProduct {
    pub id: i64,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
}

impl From<ScraperMatch> for ScrapeMatch {
    fn from(m: ScraperMatch) -> Self {
        ScrapeMatch {
            url: m.listing.url,
            title: m.listing.title,
            price: m.listing.price,
            product_id: m.product.id,
            brand: m.product.brand,
            model: m.product.model,
            confidence: m.confidence,
            potential_profit: m.potential_profit,
        }
    }
}

/// Build an ingestion batch from scraper matches.
pub fn scrape_batch(job_id: ScrapeJobId, brand: String, matches: Vec<ScraperMatch>) -> ScrapeBatch {
    ScrapeBatch {
        job_id,
        brand,
        matches: matches.into_iter().map(ScrapeMatch::from).collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJobResult {
    #[serde(default)]
    pub matches: Vec<ScraperMatch>,
}

/// A scrape job as reported when it starts and whenever its status is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJobTicket {
    pub job_id: ScrapeJobId,
    /// `pending`, `running`, `completed`, `failed` or `error`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Present once the job has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScrapeJobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Coarse reading of a scrape job's `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    InProgress,
    Completed,
    Failed,
    Unknown,
}

impl ScrapeJobTicket {
    pub fn phase(&self) -> JobPhase {
        match self.status.as_str() {
            "pending" | "running" => JobPhase::InProgress,
            "completed" => JobPhase::Completed,
            "failed" | "error" => JobPhase::Failed,
            _ => JobPhase::Unknown,
        }
    }

    /// Matches of a completed job; empty otherwise.
    pub fn into_matches(self) -> Vec<ScraperMatch> {
        self.result.map(|r| r.matches).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("scraper returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to reach scraper: {0}")]
    Request(String),

    #[error("unexpected scraper response: {0}")]
    Decode(String),
}

#[derive(Debug, Serialize)]
struct ScrapeRequest<'a> {
    brand: &'a str,
    search: &'a str,
}

/// Starts scrape jobs and reads their status. Results arrive through the
/// job-complete webhook or by polling [`ScraperClient::job_status`].
#[derive(Debug, Clone)]
pub struct ScraperClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ScraperClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a scrape. `search` defaults to the brand.
    #[instrument(skip(self), err)]
    pub async fn trigger_scrape(
        &self,
        brand: &str,
        search: Option<&str>,
    ) -> Result<ScrapeJobTicket, ScraperError> {
        let search = search.filter(|s| !s.trim().is_empty()).unwrap_or(brand);
        let response = self
            .client
            .post(format!("{}/scrape", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&ScrapeRequest { brand, search })
            .send()
            .await
            .map_err(|e| ScraperError::Request(e.to_string()))?;

        let ticket: ScrapeJobTicket = decode(response).await?;
        info!(job_id = %ticket.job_id, brand, status = %ticket.status, "scrape job started");
        Ok(ticket)
    }

    #[instrument(skip(self), err)]
    pub async fn job_status(&self, job_id: ScrapeJobId) -> Result<ScrapeJobTicket, ScraperError> {
        let response = self
            .client
            .get(format!("{}/scrape/{}", self.base_url, job_id))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ScraperError::Request(e.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ScraperError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!(status = status.as_u16(), %body, "scraper request failed");
        return Err(ScraperError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ScraperError::Decode(e.to_string()))
}
