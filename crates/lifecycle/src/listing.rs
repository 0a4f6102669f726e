//! The listing aggregate and its append-only history.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aetos_core::{AggregateRoot, DomainError, DomainResult, ListingId, ScrapeJobId};

use crate::event::LifecycleEvent;
use crate::state::{InvalidTransition, ListingState};

/// Marketplace attributes captured at discovery. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttributes {
    pub url: String,
    pub title: String,
    pub price: f64,
    /// Match confidence reported by the scraper, `0..=100`.
    pub confidence: f64,
    pub potential_profit: f64,
}

/// Who caused a state change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Trigger {
    /// The scraper's job-complete notification.
    ScraperWebhook,
    /// Results collected by polling a scrape job this service started.
    ScraperPolling,
    /// An operator through the admin surface. Requires a reason.
    Admin,
    /// Coordinator dispatch, tagged with the coordinator name.
    Coordinator(String),
    /// Internal processes (e.g. maintenance scripts).
    System,
}

impl Trigger {
    pub fn coordinator(name: impl Into<String>) -> Self {
        Self::Coordinator(name.into())
    }

    pub fn requires_reason(&self) -> bool {
        matches!(self, Trigger::Admin)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::ScraperWebhook => f.write_str("scraper_webhook"),
            Trigger::ScraperPolling => f.write_str("scraper_polling"),
            Trigger::Admin => f.write_str("admin_api"),
            Trigger::Coordinator(name) => write!(f, "coordinator:{name}"),
            Trigger::System => f.write_str("system"),
        }
    }
}

impl FromStr for Trigger {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scraper_webhook" => Ok(Trigger::ScraperWebhook),
            "scraper_polling" => Ok(Trigger::ScraperPolling),
            "admin_api" => Ok(Trigger::Admin),
            "system" => Ok(Trigger::System),
            other => match other.strip_prefix("coordinator:") {
                Some(name) if !name.is_empty() => Ok(Trigger::Coordinator(name.to_string())),
                _ => Err(DomainError::validation(format!("unknown trigger: {other}"))),
            },
        }
    }
}

impl From<Trigger> for String {
    fn from(value: Trigger) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Trigger {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Input for creating a listing from a scraper match.
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    pub product_id: i64,
    pub source_job_id: ScrapeJobId,
    pub brand: String,
    pub model: String,
    pub source: SourceAttributes,
}

impl NewListing {
    pub fn validate(&self) -> DomainResult<()> {
        if self.source.url.trim().is_empty() {
            return Err(DomainError::validation("url cannot be empty"));
        }
        if self.source.title.trim().is_empty() {
            return Err(DomainError::validation("title cannot be empty"));
        }
        if !self.source.price.is_finite() || self.source.price < 0.0 {
            return Err(DomainError::validation("price must be a non-negative number"));
        }
        if !(0.0..=100.0).contains(&self.source.confidence) {
            return Err(DomainError::validation("confidence must be within 0..=100"));
        }
        if !self.source.potential_profit.is_finite() {
            return Err(DomainError::validation("potential_profit must be a number"));
        }
        Ok(())
    }
}

/// One recorded state change. Sequence `n` is the change that produced
/// listing version `n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub listing_id: ListingId,
    pub sequence: u64,
    /// Absent only for the creation entry.
    pub from_state: Option<ListingState>,
    pub to_state: ListingState,
    pub reason: Option<String>,
    pub triggered_by: Trigger,
    pub occurred_at: DateTime<Utc>,
}

/// A validated, not-yet-committed state change: the history entry to append and
/// the event to publish. Committed as one unit by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub listing_id: ListingId,
    pub from: ListingState,
    pub to: ListingState,
    pub history: HistoryEntry,
    pub event: LifecycleEvent,
}

/// Aggregate root: a tracked marketplace listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    id: ListingId,
    product_id: i64,
    source_job_id: ScrapeJobId,
    brand: String,
    model: String,
    source: SourceAttributes,
    state: ListingState,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state_changed_at: DateTime<Utc>,
}

impl Listing {
    /// Create a listing in `FOUND`, together with its creation history entry and
    /// `ListingCreated` event.
    pub fn create(
        id: ListingId,
        new: NewListing,
        triggered_by: Trigger,
        now: DateTime<Utc>,
    ) -> DomainResult<(Listing, HistoryEntry, LifecycleEvent)> {
        new.validate()?;

        let listing = Listing {
            id,
            product_id: new.product_id,
            source_job_id: new.source_job_id,
            brand: new.brand,
            model: new.model,
            source: new.source,
            state: ListingState::Found,
            version: 1,
            created_at: now,
            updated_at: now,
            state_changed_at: now,
        };

        let history = HistoryEntry {
            listing_id: id,
            sequence: 1,
            from_state: None,
            to_state: ListingState::Found,
            reason: None,
            triggered_by: triggered_by.clone(),
            occurred_at: now,
        };

        let event = LifecycleEvent::ListingCreated {
            listing_id: id,
            product_id: listing.product_id,
            source_job_id: listing.source_job_id,
            brand: listing.brand.clone(),
            model: listing.model.clone(),
            occurred_at: now,
        };

        Ok((listing, history, event))
    }

    /// Rebuild a listing from stored columns.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: ListingId,
        product_id: i64,
        source_job_id: ScrapeJobId,
        brand: String,
        model: String,
        source: SourceAttributes,
        state: ListingState,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        state_changed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id,
            source_job_id,
            brand,
            model,
            source,
            state,
            version,
            created_at,
            updated_at,
            state_changed_at,
        }
    }

    /// Decide a transition to `to` without mutating anything.
    pub fn plan_transition(
        &self,
        to: ListingState,
        reason: Option<String>,
        triggered_by: Trigger,
        now: DateTime<Utc>,
    ) -> Result<StateTransition, InvalidTransition> {
        self.state.validate(to)?;

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let history = HistoryEntry {
            listing_id: self.id,
            sequence: self.version + 1,
            from_state: Some(self.state),
            to_state: to,
            reason: reason.clone(),
            triggered_by: triggered_by.clone(),
            occurred_at: now,
        };

        let event = LifecycleEvent::StateChanged {
            listing_id: self.id,
            from: self.state,
            to,
            reason,
            triggered_by,
            occurred_at: now,
        };

        Ok(StateTransition {
            listing_id: self.id,
            from: self.state,
            to,
            history,
            event,
        })
    }

    /// Evolve in-memory state from a committed history entry.
    pub fn apply(&mut self, entry: &HistoryEntry) {
        self.state = entry.to_state;
        self.version = entry.sequence;
        self.updated_at = entry.occurred_at;
        self.state_changed_at = entry.occurred_at;
    }

    pub fn product_id(&self) -> i64 {
        self.product_id
    }

    pub fn source_job_id(&self) -> ScrapeJobId {
        self.source_job_id
    }

    pub fn brand(&self) -> &str {
        &self.brand
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn source(&self) -> &SourceAttributes {
        &self.source
    }

    pub fn state(&self) -> ListingState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn state_changed_at(&self) -> DateTime<Utc> {
        self.state_changed_at
    }
}

impl AggregateRoot for Listing {
    type Id = ListingId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_listing() -> NewListing {
        NewListing {
            product_id: 230,
            source_job_id: ScrapeJobId::new(),
            brand: "Canon".into(),
            model: "AE-1".into(),
            source: SourceAttributes {
                url: "https://market.example/item/1".into(),
                title: "Canon AE-1 body".into(),
                price: 80.0,
                confidence: 92.5,
                potential_profit: 45.0,
            },
        }
    }

    #[test]
    fn create_starts_at_found_with_version_one() {
        let id = ListingId::new();
        let (listing, history, event) =
            Listing::create(id, new_listing(), Trigger::ScraperWebhook, Utc::now()).unwrap();

        assert_eq!(listing.state(), ListingState::Found);
        assert_eq!(listing.version(), 1);
        assert_eq!(history.sequence, 1);
        assert_eq!(history.from_state, None);
        assert_eq!(history.to_state, ListingState::Found);
        assert!(matches!(event, LifecycleEvent::ListingCreated { listing_id, .. } if listing_id == id));
    }

    #[test]
    fn create_rejects_out_of_range_confidence() {
        let mut input = new_listing();
        input.source.confidence = 101.0;
        let err = Listing::create(ListingId::new(), input, Trigger::ScraperWebhook, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_rejects_blank_url() {
        let mut input = new_listing();
        input.source.url = "  ".into();
        assert!(input.validate().is_err());
    }

    #[test]
    fn plan_then_apply_advances_state_and_version() {
        let (mut listing, _, _) =
            Listing::create(ListingId::new(), new_listing(), Trigger::ScraperWebhook, Utc::now())
                .unwrap();

        let plan = listing
            .plan_transition(
                ListingState::Messaging,
                Some(" auto-contact ".into()),
                Trigger::Admin,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(plan.history.sequence, 2);
        assert_eq!(plan.history.reason.as_deref(), Some("auto-contact"));

        listing.apply(&plan.history);
        assert_eq!(listing.state(), ListingState::Messaging);
        assert_eq!(listing.version(), 2);
    }

    #[test]
    fn plan_rejects_edges_outside_the_graph() {
        let (listing, _, _) =
            Listing::create(ListingId::new(), new_listing(), Trigger::ScraperWebhook, Utc::now())
                .unwrap();
        let err = listing
            .plan_transition(ListingState::Sold, None, Trigger::System, Utc::now())
            .unwrap_err();
        assert_eq!(err.current, ListingState::Found);
        assert_eq!(err.requested, ListingState::Sold);
    }

    #[test]
    fn blank_reason_is_normalized_away() {
        let (listing, _, _) =
            Listing::create(ListingId::new(), new_listing(), Trigger::ScraperWebhook, Utc::now())
                .unwrap();
        let plan = listing
            .plan_transition(ListingState::Cancelled, Some("   ".into()), Trigger::System, Utc::now())
            .unwrap();
        assert_eq!(plan.history.reason, None);
    }

    #[test]
    fn trigger_round_trips_through_strings() {
        for t in [
            Trigger::ScraperWebhook,
            Trigger::ScraperPolling,
            Trigger::Admin,
            Trigger::System,
            Trigger::coordinator("negotiation"),
        ] {
            assert_eq!(t.to_string().parse::<Trigger>().unwrap(), t);
        }
        assert!("coordinator:".parse::<Trigger>().is_err());
    }
}
