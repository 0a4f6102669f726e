use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::coordinators::{ScrapeJobTicket, ScraperClient, ScraperError};
use crate::ingestion::{IngestError, IngestionProcessor};
use crate::store::{LifecycleStore, StoreError};

use super::poller::{PollConfig, ScrapePoller};

/// Where the brand of a scrape came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeSource {
    Manual,
    Rotation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchedScrape {
    #[serde(flatten)]
    pub ticket: ScrapeJobTicket,
    pub brand: String,
    pub search_term: String,
    pub source: ScrapeSource,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no enabled searches in the rotation")]
    RotationEmpty,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scraper(#[from] ScraperError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// Starts scrape jobs for an explicit brand or the next rotation entry, and
/// follows each job in the background when polling is enabled.
#[derive(Debug)]
pub struct ScrapeLauncher<S> {
    store: S,
    scraper: ScraperClient,
    ingestion: IngestionProcessor<S>,
    poller: Option<Arc<ScrapePoller<S>>>,
    stop: watch::Sender<bool>,
}

impl<S> ScrapeLauncher<S>
where
    S: LifecycleStore + Clone + 'static,
{
    /// `poll: None` leaves result delivery to the job-complete webhook.
    pub fn new(store: S, scraper: ScraperClient, poll: Option<PollConfig>) -> Self {
        let ingestion = IngestionProcessor::new(store.clone());
        let poller = poll
            .map(|config| Arc::new(ScrapePoller::new(scraper.clone(), ingestion.clone(), config)));
        let (stop, _) = watch::channel(false);
        Self {
            store,
            scraper,
            ingestion,
            poller,
            stop,
        }
    }

    pub fn scraper(&self) -> &ScraperClient {
        &self.scraper
    }

    /// Start a scrape. A blank or missing `brand` advances the rotation;
    /// a blank or missing `search` defaults to the brand.
    #[instrument(skip(self), err)]
    pub async fn launch(
        &self,
        brand: Option<&str>,
        search: Option<&str>,
    ) -> Result<LaunchedScrape, LaunchError> {
        let explicit = brand.map(str::trim).filter(|b| !b.is_empty());
        let (brand, search_term, source) = match explicit {
            Some(brand) => {
                let search = search
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(brand);
                (brand.to_string(), search.to_string(), ScrapeSource::Manual)
            }
            None => {
                let next = self
                    .store
                    .advance_rotation(Utc::now())
                    .await?
                    .ok_or(LaunchError::RotationEmpty)?;
                (next.brand, next.search_term, ScrapeSource::Rotation)
            }
        };

        let ticket = self
            .scraper
            .trigger_scrape(&brand, Some(&search_term))
            .await?;
        self.ingestion
            .record_scrape_job(ticket.job_id, &brand, &search_term)
            .await?;

        if let Some(poller) = &self.poller {
            let poller = poller.clone();
            let mut stop = self.stop.subscribe();
            let (job_id, brand) = (ticket.job_id, brand.clone());
            tokio::spawn(async move {
                poller.poll(job_id, &brand, &mut stop).await;
            });
        }

        info!(job_id = %ticket.job_id, %brand, %search_term, ?source, "scrape launched");
        Ok(LaunchedScrape {
            ticket,
            brand,
            search_term,
            source,
        })
    }

    /// Cancel every background poll.
    pub fn stop_polling(&self) {
        self.stop.send_replace(true);
    }
}
