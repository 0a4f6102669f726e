//! Transactional outbox: entries written alongside state changes, and the relay
//! that forwards them to the broker.

pub mod relay;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use aetos_core::{EventId, ListingId};
use aetos_events::{Event, EventEnvelope};

pub use relay::{DrainReport, Relay, RelayConfig, RelayError, RelayHandle, RelayStats};

/// One event awaiting (or past) publication.
///
/// Written in the same atomic unit as the state change that produced it.
/// `published_at` is set only after the broker acknowledged the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub event_id: EventId,
    pub listing_id: Option<ListingId>,
    pub routing_key: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Store-assigned insertion ordinal; breaks `created_at` ties. Zero until
    /// the entry is stored.
    pub position: u64,
}

impl OutboxEntry {
    /// Build an unpublished entry for a typed event with a fresh `event_id`.
    pub fn for_event<E>(event: &E) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id: EventId::new(),
            listing_id: None,
            routing_key: event.event_type().to_string(),
            payload: serde_json::to_value(event)?,
            created_at: event.occurred_at(),
            published_at: None,
            position: 0,
        })
    }

    pub fn with_listing(mut self, listing_id: Option<ListingId>) -> Self {
        self.listing_id = listing_id;
        self
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// The broker message for this entry.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.routing_key.clone(),
            self.listing_id,
            self.created_at,
            self.payload.clone(),
        )
    }
}
