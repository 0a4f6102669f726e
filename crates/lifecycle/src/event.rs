//! Events published for committed lifecycle changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aetos_core::{ListingId, ScrapeJobId};
use aetos_events::Event;

use crate::listing::Trigger;
use crate::state::ListingState;

/// Everything the orchestrator announces on the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ListingCreated {
        listing_id: ListingId,
        product_id: i64,
        source_job_id: ScrapeJobId,
        brand: String,
        model: String,
        occurred_at: DateTime<Utc>,
    },
    StateChanged {
        listing_id: ListingId,
        from: ListingState,
        to: ListingState,
        reason: Option<String>,
        triggered_by: Trigger,
        occurred_at: DateTime<Utc>,
    },
    ScrapeJobCreated {
        job_id: ScrapeJobId,
        brand: String,
        search: String,
        occurred_at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// The listing this event concerns, if any.
    pub fn listing_id(&self) -> Option<ListingId> {
        match self {
            LifecycleEvent::ListingCreated { listing_id, .. }
            | LifecycleEvent::StateChanged { listing_id, .. } => Some(*listing_id),
            LifecycleEvent::ScrapeJobCreated { .. } => None,
        }
    }
}

impl Event for LifecycleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::ListingCreated { .. } => "listing.created",
            LifecycleEvent::StateChanged { to, .. } => to.routing_key(),
            LifecycleEvent::ScrapeJobCreated { .. } => "scraper.job.created",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::ListingCreated { occurred_at, .. }
            | LifecycleEvent::StateChanged { occurred_at, .. }
            | LifecycleEvent::ScrapeJobCreated { occurred_at, .. } => *occurred_at,
        }
    }
}
