use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use aetos_core::{AggregateRoot, EventId, ExpectedVersion, ListingId, ScrapeJobId};
use aetos_lifecycle::{HistoryEntry, Listing};

use super::r#trait::{
    LifecycleStore, ListingCreation, ListingFilter, ListingMutation, ListingPage, StoreError,
};
use super::rotation::{self, NewRotationEntry, RotationEntry, RotationSearch};
use crate::outbox::OutboxEntry;

#[derive(Debug, Default)]
struct Tables {
    listings: HashMap<ListingId, Listing>,
    history: HashMap<ListingId, Vec<HistoryEntry>>,
    outbox: Vec<OutboxEntry>,
    next_position: u64,
    /// Non-terminal listings by `(product_id, url)`.
    active: HashMap<(i64, String), ListingId>,
    /// Every `(source_job_id, product_id, url)` ever ingested.
    ingested: HashSet<(ScrapeJobId, i64, String)>,
    /// Ordered by id.
    rotation: Vec<RotationEntry>,
}

impl Tables {
    fn push_outbox(&mut self, mut entry: OutboxEntry) {
        self.next_position += 1;
        entry.position = self.next_position;
        self.outbox.push(entry);
    }
}

/// In-memory listing store.
///
/// Intended for tests/dev. One lock guards every table, so each write is a
/// single atomic unit; the lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryLifecycleStore {
    tables: RwLock<Tables>,
}

impl InMemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("lock poisoned".to_string())
    }

    /// Every outbox entry, published or not, in insertion order.
    pub fn outbox_snapshot(&self) -> Vec<OutboxEntry> {
        self.tables
            .read()
            .map(|t| t.outbox.clone())
            .unwrap_or_default()
    }

    pub fn listing_count(&self) -> usize {
        self.tables.read().map(|t| t.listings.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn create(&self, creation: ListingCreation) -> Result<ListingId, StoreError> {
        let ListingCreation {
            listing,
            history,
            outbox,
        } = creation;

        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;

        let url = listing.source().url.clone();
        let active_key = (listing.product_id(), url.clone());
        let ingest_key = (listing.source_job_id(), listing.product_id(), url);

        if tables.ingested.contains(&ingest_key) {
            return Err(StoreError::DuplicateListing(format!(
                "job {} already produced product {} at {}",
                ingest_key.0, ingest_key.1, ingest_key.2
            )));
        }
        if let Some(existing) = tables.active.get(&active_key) {
            return Err(StoreError::DuplicateListing(format!(
                "listing {existing} already tracks product {} at {}",
                active_key.0, active_key.1
            )));
        }

        let id = *listing.id();
        tables.ingested.insert(ingest_key);
        tables.active.insert(active_key, id);
        tables.history.insert(id, vec![history]);
        tables.listings.insert(id, listing);
        tables.push_outbox(outbox);

        Ok(id)
    }

    async fn get(&self, id: ListingId) -> Result<Listing, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        tables.listings.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn compare_and_update(
        &self,
        id: ListingId,
        expected: ExpectedVersion,
        mutation: ListingMutation,
    ) -> Result<Listing, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;

        let current = tables.listings.get(&id).ok_or(StoreError::NotFound(id))?;
        if !expected.matches(current.version()) {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected.value(),
                actual: current.version(),
            });
        }
        mutation.check_sequence(expected)?;

        let mut updated = current.clone();
        updated.apply(&mutation.history);

        if updated.state().is_terminal() {
            let key = (updated.product_id(), updated.source().url.clone());
            if tables.active.get(&key) == Some(&id) {
                tables.active.remove(&key);
            }
        }

        tables.listings.insert(id, updated.clone());
        tables.history.entry(id).or_default().push(mutation.history);
        tables.push_outbox(mutation.outbox);

        Ok(updated)
    }

    async fn history(&self, id: ListingId) -> Result<Vec<HistoryEntry>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        if !tables.listings.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(tables.history.get(&id).cloned().unwrap_or_default())
    }

    async fn search(&self, filter: ListingFilter) -> Result<ListingPage, StoreError> {
        let filter = filter.normalized();
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;

        let mut matching: Vec<&Listing> = tables
            .listings
            .values()
            .filter(|l| filter.matches(l))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(a.id()))
        });

        let total = matching.len() as u64;
        let listings = matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect();

        Ok(ListingPage { listings, total })
    }

    async fn append_outbox(&self, entry: OutboxEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        tables.push_outbox(entry);
        Ok(())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        let mut pending: Vec<OutboxEntry> = tables
            .outbox
            .iter()
            .filter(|e| !e.is_published())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.position.cmp(&b.position))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(
        &self,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| StoreError::Backend(format!("unknown outbox entry {event_id}")))?;
        if entry.published_at.is_none() {
            entry.published_at = Some(published_at);
        }
        Ok(())
    }

    async fn outbox_backlog(&self) -> Result<u64, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.outbox.iter().filter(|e| !e.is_published()).count() as u64)
    }
    async fn add_rotation_entry(&self, entry: NewRotationEntry) -> Result<RotationEntry, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let id = tables.rotation.last().map_or(1, |e| e.id + 1);
        let entry = RotationEntry {
            id,
            brand: entry.brand,
            search_term: entry.search_term,
            enabled: entry.enabled,
            last_searched: false,
            last_searched_at: None,
        };
        tables.rotation.push(entry.clone());
        Ok(entry)
    }

    async fn rotation(&self) -> Result<Vec<RotationEntry>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.rotation.clone())
    }

    async fn advance_rotation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<RotationSearch>, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let Some(next) = rotation::next_index(&tables.rotation) else {
            return Ok(None);
        };
        for (i, entry) in tables.rotation.iter_mut().enumerate() {
            entry.last_searched = i == next;
            if i == next {
                entry.last_searched_at = Some(now);
            }
        }
        Ok(Some(tables.rotation[next].search()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aetos_lifecycle::{ListingState, NewListing, SourceAttributes, Trigger};

    fn new_listing(job: ScrapeJobId, product_id: i64, url: &str) -> NewListing {
        NewListing {
            product_id,
            source_job_id: job,
            brand: "Leica".into(),
            model: "M6".into(),
            source: SourceAttributes {
                url: url.into(),
                title: "Leica M6".into(),
                price: 1500.0,
                confidence: 88.0,
                potential_profit: 400.0,
            },
        }
    }

    async fn seed(store: &InMemoryLifecycleStore, job: ScrapeJobId, product_id: i64, url: &str) -> ListingId {
        let creation =
            ListingCreation::new(new_listing(job, product_id, url), Trigger::ScraperWebhook, Utc::now())
                .unwrap();
        store.create(creation).await.unwrap()
    }

    async fn mutate(
        store: &InMemoryLifecycleStore,
        id: ListingId,
        to: ListingState,
    ) -> Result<Listing, StoreError> {
        let listing = store.get(id).await?;
        let plan = listing
            .plan_transition(to, None, Trigger::System, Utc::now())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        store
            .compare_and_update(
                id,
                ExpectedVersion::exact(listing.version()),
                ListingMutation::from_transition(plan)?,
            )
            .await
    }

    #[tokio::test]
    async fn create_writes_listing_history_and_outbox_together() {
        let store = InMemoryLifecycleStore::new();
        let id = seed(&store, ScrapeJobId::new(), 230, "https://m/1").await;

        assert_eq!(store.get(id).await.unwrap().version(), 1);
        assert_eq!(store.history(id).await.unwrap().len(), 1);
        let outbox = store.pending_outbox(10).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].routing_key, "listing.created");
        assert_eq!(outbox[0].listing_id, Some(id));
    }

    #[tokio::test]
    async fn active_duplicate_is_rejected_until_terminal() {
        let store = InMemoryLifecycleStore::new();
        let id = seed(&store, ScrapeJobId::new(), 7, "https://m/dup").await;

        let again = ListingCreation::new(
            new_listing(ScrapeJobId::new(), 7, "https://m/dup"),
            Trigger::ScraperWebhook,
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(
            store.create(again.clone()).await,
            Err(StoreError::DuplicateListing(_))
        ));

        mutate(&store, id, ListingState::Cancelled).await.unwrap();
        store.create(again).await.unwrap();
        assert_eq!(store.listing_count(), 2);
    }

    #[tokio::test]
    async fn same_job_cannot_recreate_even_after_cancellation() {
        let store = InMemoryLifecycleStore::new();
        let job = ScrapeJobId::new();
        let id = seed(&store, job, 7, "https://m/x").await;
        mutate(&store, id, ListingState::Cancelled).await.unwrap();

        let replay =
            ListingCreation::new(new_listing(job, 7, "https://m/x"), Trigger::ScraperWebhook, Utc::now())
                .unwrap();
        assert!(matches!(
            store.create(replay).await,
            Err(StoreError::DuplicateListing(_))
        ));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict_and_changes_nothing() {
        let store = InMemoryLifecycleStore::new();
        let id = seed(&store, ScrapeJobId::new(), 1, "https://m/c").await;
        let stale = store.get(id).await.unwrap();

        mutate(&store, id, ListingState::Messaging).await.unwrap();

        let plan = stale
            .plan_transition(ListingState::Cancelled, None, Trigger::System, Utc::now())
            .unwrap();
        let err = store
            .compare_and_update(
                id,
                ExpectedVersion::exact(stale.version()),
                ListingMutation::from_transition(plan).unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2
            }
        ));
        let now = store.get(id).await.unwrap();
        assert_eq!(now.state(), ListingState::Messaging);
        assert_eq!(store.history(id).await.unwrap().len(), 2);
        assert_eq!(store.outbox_backlog().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pending_outbox_is_ordered_and_mark_is_idempotent() {
        let store = InMemoryLifecycleStore::new();
        let id = seed(&store, ScrapeJobId::new(), 1, "https://m/o").await;
        mutate(&store, id, ListingState::Messaging).await.unwrap();

        let pending = store.pending_outbox(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].position < pending[1].position);
        assert_eq!(pending[1].routing_key, "listing.state.messaging");

        let first = Utc::now();
        store.mark_published(pending[0].event_id, first).await.unwrap();
        store
            .mark_published(pending[0].event_id, first + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let snapshot = store.outbox_snapshot();
        assert_eq!(snapshot[0].published_at, Some(first));
        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_filters_and_pages_newest_first() {
        let store = InMemoryLifecycleStore::new();
        let job = ScrapeJobId::new();
        for i in 0..5 {
            seed(&store, job, i, &format!("https://m/{i}")).await;
        }
        let cancelled = seed(&store, job, 99, "https://m/99").await;
        mutate(&store, cancelled, ListingState::Cancelled).await.unwrap();

        let page = store
            .search(ListingFilter {
                state: Some(ListingState::Found),
                limit: 2,
                ..ListingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.listings.len(), 2);
        assert!(page.listings[0].created_at() >= page.listings[1].created_at());

        let by_brand = store
            .search(ListingFilter {
                brand: Some("leica".into()),
                limit: 0,
                ..ListingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_brand.total, 6);
        assert_eq!(by_brand.listings.len(), 1, "limit is clamped to at least one");
    }

    #[tokio::test]
    async fn unknown_listing_is_not_found() {
        let store = InMemoryLifecycleStore::new();
        let missing = ListingId::new();
        assert!(matches!(store.get(missing).await, Err(StoreError::NotFound(id)) if id == missing));
        assert!(matches!(store.history(missing).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn rotation_cycles_through_enabled_entries() {
        let store = InMemoryLifecycleStore::new();
        for (brand, term, enabled) in [
            ("Leica", None, true),
            ("Contax", Some("Contax T2"), false),
            ("Nikon", Some("Nikon F3"), true),
        ] {
            store
                .add_rotation_entry(NewRotationEntry {
                    brand: brand.into(),
                    search_term: term.map(String::from),
                    enabled,
                })
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let search = store.advance_rotation(Utc::now()).await.unwrap().unwrap();
            seen.push(search.search_term);
        }
        assert_eq!(seen, ["Leica", "Nikon F3", "Leica"]);

        let rows = store.rotation().await.unwrap();
        assert_eq!(rows.iter().filter(|e| e.last_searched).count(), 1);
        assert!(rows[0].last_searched && rows[0].last_searched_at.is_some());
        assert!(rows[1].last_searched_at.is_none());
    }

    #[tokio::test]
    async fn empty_rotation_yields_nothing() {
        let store = InMemoryLifecycleStore::new();
        assert_eq!(store.advance_rotation(Utc::now()).await.unwrap(), None);
    }
}
