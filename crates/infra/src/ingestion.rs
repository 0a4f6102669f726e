//! Scrape result ingestion.
//!
//! A batch is idempotent per `(job_id, product_id, url)`: redelivering the same
//! job-complete notification creates nothing new.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use aetos_core::{ListingId, ScrapeJobId};
use aetos_lifecycle::{LifecycleEvent, NewListing, SourceAttributes, Trigger};

use crate::outbox::OutboxEntry;
use crate::store::{LifecycleStore, ListingCreation, StoreError};

/// One product match reported by the scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeMatch {
    pub url: String,
    pub title: String,
    pub price: f64,
    pub product_id: i64,
    pub brand: String,
    pub model: String,
    pub confidence: f64,
    pub potential_profit: f64,
}

/// The matches of one completed scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeBatch {
    pub job_id: ScrapeJobId,
    pub brand: String,
    pub matches: Vec<ScrapeMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub created: usize,
    pub skipped: usize,
    pub created_ids: Vec<ListingId>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns scraper matches into `FOUND` listings.
#[derive(Debug, Clone)]
pub struct IngestionProcessor<S> {
    store: S,
}

impl<S> IngestionProcessor<S>
where
    S: LifecycleStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Ingest every match of a batch delivered by the job-complete webhook.
    ///
    /// Duplicates and invalid matches are skipped. Any other store failure
    /// aborts so the notifier retries; matches created before the failure are
    /// skipped on that retry.
    pub async fn ingest_batch(&self, batch: ScrapeBatch) -> Result<IngestOutcome, IngestError> {
        self.ingest_batch_as(batch, Trigger::ScraperWebhook).await
    }

    /// Ingest a batch, recording `triggered_by` on every creation entry.
    #[instrument(
        skip(self, batch),
        fields(job_id = %batch.job_id, brand = %batch.brand, matches = batch.matches.len()),
        err
    )]
    pub async fn ingest_batch_as(
        &self,
        batch: ScrapeBatch,
        triggered_by: Trigger,
    ) -> Result<IngestOutcome, IngestError> {
        let mut outcome = IngestOutcome::default();

        for m in batch.matches {
            let brand = if m.brand.trim().is_empty() {
                batch.brand.clone()
            } else {
                m.brand
            };
            let new = NewListing {
                product_id: m.product_id,
                source_job_id: batch.job_id,
                brand,
                model: m.model,
                source: SourceAttributes {
                    url: m.url,
                    title: m.title,
                    price: m.price,
                    confidence: m.confidence,
                    potential_profit: m.potential_profit,
                },
            };
            let product_id = new.product_id;

            let creation = match ListingCreation::new(new, triggered_by.clone(), Utc::now()) {
                Ok(creation) => creation,
                Err(StoreError::Invalid(err)) => {
                    warn!(product_id, error = %err, "skipping invalid scrape match");
                    outcome.skipped += 1;
                    continue;
                }
                Err(other) => return Err(other.into()),
            };

            match self.store.create(creation).await {
                Ok(id) => {
                    debug!(listing_id = %id, product_id, "listing created");
                    outcome.created += 1;
                    outcome.created_ids.push(id);
                }
                Err(StoreError::DuplicateListing(detail)) => {
                    debug!(product_id, %detail, "duplicate match skipped");
                    outcome.skipped += 1;
                }
                Err(other) => return Err(other.into()),
            }
        }

        info!(
            job_id = %batch.job_id,
            created = outcome.created,
            skipped = outcome.skipped,
            "scrape batch ingested"
        );
        Ok(outcome)
    }

    /// Record that a scrape job was started, for downstream consumers.
    #[instrument(skip(self), err)]
    pub async fn record_scrape_job(
        &self,
        job_id: ScrapeJobId,
        brand: &str,
        search: &str,
    ) -> Result<(), IngestError> {
        let event = LifecycleEvent::ScrapeJobCreated {
            job_id,
            brand: brand.to_string(),
            search: search.to_string(),
            occurred_at: Utc::now(),
        };
        let entry = OutboxEntry::for_event(&event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.append_outbox(entry).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use aetos_lifecycle::ListingState;

    use crate::store::{InMemoryLifecycleStore, ListingFilter};

    fn scrape_match(product_id: i64, url: &str) -> ScrapeMatch {
        ScrapeMatch {
            url: url.to_string(),
            title: "Hasselblad 500C/M".into(),
            price: 900.0,
            product_id,
            brand: "Hasselblad".into(),
            model: "500C/M".into(),
            confidence: 91.5,
            potential_profit: 400.0,
        }
    }

    fn batch(matches: Vec<ScrapeMatch>) -> ScrapeBatch {
        ScrapeBatch {
            job_id: ScrapeJobId::new(),
            brand: "Hasselblad".into(),
            matches,
        }
    }

    #[tokio::test]
    async fn creates_found_listings_and_is_idempotent() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let processor = IngestionProcessor::new(store.clone());
        let batch = batch(vec![
            scrape_match(230, "https://example.test/a"),
            scrape_match(231, "https://example.test/b"),
        ]);

        let first = processor.ingest_batch(batch.clone()).await.unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.skipped, 0);

        let second = processor.ingest_batch(batch).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(store.listing_count(), 2);

        let page = store.search(ListingFilter::default()).await.unwrap();
        assert!(page.listings.iter().all(|l| l.state() == ListingState::Found));
    }

    #[tokio::test]
    async fn invalid_matches_are_skipped_not_fatal() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let processor = IngestionProcessor::new(store.clone());
        let mut bad = scrape_match(1, "");
        bad.title = "no url".into();

        let outcome = processor
            .ingest_batch(batch(vec![bad, scrape_match(2, "https://example.test/ok")]))
            .await
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.skipped, 1);
    }

    #[tokio::test]
    async fn match_brand_falls_back_to_batch_brand() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let processor = IngestionProcessor::new(store.clone());
        let mut m = scrape_match(7, "https://example.test/c");
        m.brand = String::new();

        let outcome = processor.ingest_batch(batch(vec![m])).await.unwrap();
        let listing = store.get(outcome.created_ids[0]).await.unwrap();
        assert_eq!(listing.brand(), "Hasselblad");
    }

    #[tokio::test]
    async fn scrape_job_lands_in_the_outbox() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let processor = IngestionProcessor::new(store.clone());

        processor
            .record_scrape_job(ScrapeJobId::new(), "Pentax", "67")
            .await
            .unwrap();

        let outbox = store.outbox_snapshot();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].routing_key, "scraper.job.created");
        assert_eq!(outbox[0].listing_id, None);
    }

    #[tokio::test]
    async fn polled_batches_record_their_trigger() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let processor = IngestionProcessor::new(store.clone());

        let outcome = processor
            .ingest_batch_as(
                batch(vec![scrape_match(9, "https://example.test/p")]),
                Trigger::ScraperPolling,
            )
            .await
            .unwrap();

        let history = store.history(outcome.created_ids[0]).await.unwrap();
        assert_eq!(history[0].triggered_by, Trigger::ScraperPolling);
    }
}
