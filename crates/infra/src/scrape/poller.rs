use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use aetos_core::ScrapeJobId;
use aetos_lifecycle::Trigger;

use crate::coordinators::{JobPhase, ScrapeJobTicket, ScraperClient, scrape_batch};
use crate::ingestion::{IngestOutcome, IngestionProcessor};
use crate::store::LifecycleStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait before each status check, including the first.
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(180),
            max_polls: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ingested(IngestOutcome),
    /// The scraper reported the job as failed.
    Failed(String),
    TimedOut { polls: u32 },
    Cancelled,
}

/// Follows one scrape job until it completes, then ingests its matches.
///
/// Status check and ingestion failures use up a poll and are retried on the
/// next one; ingestion is idempotent per job, so a retry after a partial batch
/// only creates what is missing.
#[derive(Debug, Clone)]
pub struct ScrapePoller<S> {
    scraper: ScraperClient,
    ingestion: IngestionProcessor<S>,
    config: PollConfig,
}

impl<S> ScrapePoller<S>
where
    S: LifecycleStore,
{
    pub fn new(scraper: ScraperClient, ingestion: IngestionProcessor<S>, config: PollConfig) -> Self {
        Self {
            scraper,
            ingestion,
            config,
        }
    }

    #[instrument(skip(self, shutdown), fields(job_id = %job_id))]
    pub async fn poll(
        &self,
        job_id: ScrapeJobId,
        brand: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PollOutcome {
        for attempt in 1..=self.config.max_polls {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(attempt, "scrape polling cancelled");
                        return PollOutcome::Cancelled;
                    }
                }
            }

            let ticket = match self.scraper.job_status(job_id).await {
                Ok(ticket) => ticket,
                Err(err) => {
                    warn!(attempt, error = %err, "scrape status check failed");
                    continue;
                }
            };

            match ticket.phase() {
                JobPhase::Completed => {
                    let batch = scrape_batch(job_id, brand.to_string(), ticket.into_matches());
                    match self.ingestion.ingest_batch_as(batch, Trigger::ScraperPolling).await {
                        Ok(outcome) => {
                            info!(
                                attempt,
                                created = outcome.created,
                                skipped = outcome.skipped,
                                "polled scrape job ingested"
                            );
                            return PollOutcome::Ingested(outcome);
                        }
                        Err(err) => warn!(attempt, error = %err, "ingesting polled results failed"),
                    }
                }
                JobPhase::Failed => {
                    let ScrapeJobTicket {
                        status,
                        error,
                        message,
                        ..
                    } = ticket;
                    let reason = error.or(message).unwrap_or(status);
                    warn!(attempt, %reason, "scrape job failed");
                    return PollOutcome::Failed(reason);
                }
                JobPhase::InProgress => debug!(attempt, status = %ticket.status, "scrape job still running"),
                JobPhase::Unknown => warn!(attempt, status = %ticket.status, "unknown scrape job status"),
            }
        }

        warn!(polls = self.config.max_polls, "scrape job polling timed out");
        PollOutcome::TimedOut {
            polls: self.config.max_polls,
        }
    }
}
