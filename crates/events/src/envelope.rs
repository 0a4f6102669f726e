use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use aetos_core::{EventId, ListingId};

/// Envelope for a published event: the unit the relay hands to the broker.
///
/// Notes:
/// - `event_id` is globally unique and stable across redeliveries; consumers
///   de-duplicate on it.
/// - `routing_key` selects subscribers (`listing.created`, `listing.state.<state>`,
///   `scraper.job.created`).
/// - `listing_id` is absent for events that do not concern a single listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E = JsonValue> {
    event_id: EventId,
    routing_key: String,
    listing_id: Option<ListingId>,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: EventId,
        routing_key: impl Into<String>,
        listing_id: Option<ListingId>,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            routing_key: routing_key.into(),
            listing_id,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn listing_id(&self) -> Option<ListingId> {
        self.listing_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Decode the JSON payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
