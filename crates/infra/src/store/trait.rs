use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use aetos_core::{DomainError, EventId, ExpectedVersion, ListingId};
use aetos_lifecycle::{HistoryEntry, Listing, ListingState, NewListing, StateTransition, Trigger};

use super::rotation::{NewRotationEntry, RotationEntry, RotationSearch};
use crate::outbox::OutboxEntry;

/// A new listing plus the records created with it: the `null -> FOUND` history
/// entry and the `ListingCreated` outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingCreation {
    pub listing: Listing,
    pub history: HistoryEntry,
    pub outbox: OutboxEntry,
}

impl ListingCreation {
    pub fn new(
        new: NewListing,
        triggered_by: Trigger,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let id = ListingId::new();
        let (listing, history, event) = Listing::create(id, new, triggered_by, now)?;
        let outbox = OutboxEntry::for_event(&event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?
            .with_listing(Some(id));
        Ok(Self {
            listing,
            history,
            outbox,
        })
    }
}

/// A state change to commit against a known version: the new state, the
/// history entry, and the outbox entry. Applied all together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingMutation {
    pub to_state: ListingState,
    pub history: HistoryEntry,
    pub outbox: OutboxEntry,
}

impl ListingMutation {
    pub fn from_transition(transition: StateTransition) -> Result<Self, StoreError> {
        let outbox = OutboxEntry::for_event(&transition.event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?
            .with_listing(Some(transition.listing_id));
        Ok(Self {
            to_state: transition.to,
            history: transition.history,
            outbox,
        })
    }

    /// A mutation decided against version `v` must produce history entry `v + 1`.
    pub(crate) fn check_sequence(&self, expected: ExpectedVersion) -> Result<(), StoreError> {
        if self.history.sequence != expected.value() + 1 {
            return Err(StoreError::Backend(format!(
                "mutation sequence {} does not follow expected version {}",
                self.history.sequence, expected
            )));
        }
        Ok(())
    }
}

/// Admin search criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFilter {
    pub state: Option<ListingState>,
    pub brand: Option<String>,
    pub product_id: Option<i64>,
    pub limit: u32,
    pub offset: u32,
}

impl ListingFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 200;

    /// Clamp `limit` into `1..=MAX_LIMIT`.
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, Self::MAX_LIMIT);
        self
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        self.state.is_none_or(|s| listing.state() == s)
            && self
                .brand
                .as_deref()
                .is_none_or(|b| listing.brand().eq_ignore_ascii_case(b))
            && self.product_id.is_none_or(|p| listing.product_id() == p)
    }
}

impl Default for ListingFilter {
    fn default() -> Self {
        Self {
            state: None,
            brand: None,
            product_id: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// One page of search results, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub listings: Vec<Listing>,
    pub total: u64,
}

/// Listing store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, uniqueness) as
/// opposed to lifecycle rule violations, which the transition engine reports.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing not found: {0}")]
    NotFound(ListingId),

    /// An active listing already tracks this `(product_id, url)`, or this scrape
    /// job already produced it.
    #[error("duplicate listing: {0}")]
    DuplicateListing(String),

    #[error("optimistic concurrency check failed (expected {expected}, actual {actual})")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("invalid listing: {0}")]
    Invalid(#[from] DomainError),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Listing store with optimistic concurrency and a transactional outbox.
///
/// Listings, their history, and the outbox live in one store so that every
/// state change and the event announcing it commit atomically.
///
/// ## Write Semantics
///
/// - `create` inserts listing + creation history + `ListingCreated` outbox
///   entry, rejecting duplicates by active `(product_id, url)` and by
///   `(source_job_id, product_id, url)`.
/// - `compare_and_update` applies a [`ListingMutation`] only if the stored
///   version equals `expected`; there is no unconditional write.
/// - `append_outbox` records events that do not change a listing (scrape jobs).
///
/// ## Outbox Semantics
///
/// `pending_outbox` returns unpublished entries ordered by
/// `(created_at, position)`. `mark_published` is idempotent; the first
/// acknowledgement time wins.
///
/// ## Search Rotation
///
/// `advance_rotation` moves the `last_searched` marker to the next enabled
/// entry and returns its search. Concurrent callers each get a distinct step.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn create(&self, creation: ListingCreation) -> Result<ListingId, StoreError>;

    async fn get(&self, id: ListingId) -> Result<Listing, StoreError>;

    async fn compare_and_update(
        &self,
        id: ListingId,
        expected: ExpectedVersion,
        mutation: ListingMutation,
    ) -> Result<Listing, StoreError>;

    /// Full history of a listing, ordered by sequence.
    async fn history(&self, id: ListingId) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn search(&self, filter: ListingFilter) -> Result<ListingPage, StoreError>;

    async fn append_outbox(&self, entry: OutboxEntry) -> Result<(), StoreError>;

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn mark_published(
        &self,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Number of entries not yet published.
    async fn outbox_backlog(&self) -> Result<u64, StoreError>;

    async fn add_rotation_entry(&self, entry: NewRotationEntry) -> Result<RotationEntry, StoreError>;

    /// Every rotation entry, ordered by id.
    async fn rotation(&self) -> Result<Vec<RotationEntry>, StoreError>;

    /// `None` when no entry is enabled.
    async fn advance_rotation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<RotationSearch>, StoreError>;

    /// Cheap liveness check for health reporting.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl<S> LifecycleStore for Arc<S>
where
    S: LifecycleStore + ?Sized,
{
    async fn create(&self, creation: ListingCreation) -> Result<ListingId, StoreError> {
        (**self).create(creation).await
    }

    async fn get(&self, id: ListingId) -> Result<Listing, StoreError> {
        (**self).get(id).await
    }

    async fn compare_and_update(
        &self,
        id: ListingId,
        expected: ExpectedVersion,
        mutation: ListingMutation,
    ) -> Result<Listing, StoreError> {
        (**self).compare_and_update(id, expected, mutation).await
    }

    async fn history(&self, id: ListingId) -> Result<Vec<HistoryEntry>, StoreError> {
        (**self).history(id).await
    }

    async fn search(&self, filter: ListingFilter) -> Result<ListingPage, StoreError> {
        (**self).search(filter).await
    }

    async fn append_outbox(&self, entry: OutboxEntry) -> Result<(), StoreError> {
        (**self).append_outbox(entry).await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        (**self).pending_outbox(limit).await
    }

    async fn mark_published(
        &self,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_published(event_id, published_at).await
    }

    async fn outbox_backlog(&self) -> Result<u64, StoreError> {
        (**self).outbox_backlog().await
    }

    async fn add_rotation_entry(&self, entry: NewRotationEntry) -> Result<RotationEntry, StoreError> {
        (**self).add_rotation_entry(entry).await
    }

    async fn rotation(&self) -> Result<Vec<RotationEntry>, StoreError> {
        (**self).rotation().await
    }

    async fn advance_rotation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<RotationSearch>, StoreError> {
        (**self).advance_rotation(now).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}
