//! Postgres-backed listing store.
//!
//! Listings, history, and the outbox share one database so every write runs in
//! a single transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `DuplicateListing` | Active `(product_id, url)` or ingestion key already present |
//! | Database (check violation) | `23514` | `Backend` | Row violates a column check |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / network | N/A | `Backend` | Connection failures |
//!
//! Version mismatches never surface as database errors: the version-guarded
//! `UPDATE` matches zero rows and the store reports `ConcurrencyConflict` with
//! the version it then reads back.
//!
//! Advancing the search rotation locks every rotation row for the duration of
//! its transaction, so concurrent schedulers never pick the same step twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use aetos_core::{AggregateRoot, EventId, ExpectedVersion, ListingId, ScrapeJobId};
use aetos_lifecycle::{HistoryEntry, Listing, ListingState, SourceAttributes, Trigger};

use super::r#trait::{
    LifecycleStore, ListingCreation, ListingFilter, ListingMutation, ListingPage, StoreError,
};
use super::rotation::{self, NewRotationEntry, RotationEntry, RotationSearch};
use crate::outbox::OutboxEntry;

const MIGRATIONS: [(&str, &str); 2] = [
    ("0001_lifecycle", include_str!("../../migrations/0001_lifecycle.sql")),
    ("0002_search_rotation", include_str!("../../migrations/0002_search_rotation.sql")),
];

const ROTATION_COLUMNS: &str =
    "id, brand, search_term, enabled, last_searched, last_searched_at";

const LISTING_COLUMNS: &str = "id, product_id, source_job_id, brand, model, url, title, price, \
     confidence, potential_profit, state, version, created_at, updated_at, state_changed_at";

/// Postgres-backed listing store with a transactional outbox.
///
/// Uniqueness rules live in partial unique indexes (see the migration), so two
/// concurrent ingestions of the same listing cannot both commit.
#[derive(Debug, Clone)]
pub struct PostgresLifecycleStore {
    pool: Arc<PgPool>,
}

impl PostgresLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and return a store over a fresh pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(name, e))?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl LifecycleStore for PostgresLifecycleStore {
    #[instrument(
        skip(self, creation),
        fields(
            listing_id = %creation.listing.id(),
            product_id = creation.listing.product_id()
        ),
        err
    )]
    async fn create(&self, creation: ListingCreation) -> Result<ListingId, StoreError> {
        let ListingCreation {
            listing,
            history,
            outbox,
        } = creation;

        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO listings (
                id, product_id, source_job_id, brand, model, url, title, price,
                confidence, potential_profit, state, version, created_at, updated_at,
                state_changed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(listing.id().as_uuid())
        .bind(listing.product_id())
        .bind(listing.source_job_id().as_uuid())
        .bind(listing.brand())
        .bind(listing.model())
        .bind(&listing.source().url)
        .bind(&listing.source().title)
        .bind(listing.source().price)
        .bind(listing.source().confidence)
        .bind(listing.source().potential_profit)
        .bind(listing.state().as_str())
        .bind(1_i64)
        .bind(listing.created_at())
        .bind(listing.updated_at())
        .bind(listing.state_changed_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_listing", e))?;

        insert_history(&mut tx, &history).await?;
        insert_outbox(&mut tx, &outbox).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(*listing.id())
    }

    #[instrument(skip(self), fields(listing_id = %id), err)]
    async fn get(&self, id: ListingId) -> Result<Listing, StoreError> {
        let row = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_listing", e))?
            .ok_or(StoreError::NotFound(id))?;

        decode_listing(&row)
    }

    #[instrument(
        skip(self, mutation),
        fields(
            listing_id = %id,
            expected_version = %expected,
            to_state = %mutation.to_state
        ),
        err
    )]
    async fn compare_and_update(
        &self,
        id: ListingId,
        expected: ExpectedVersion,
        mutation: ListingMutation,
    ) -> Result<Listing, StoreError> {
        mutation.check_sequence(expected)?;

        let mut tx = self.begin().await?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE listings
            SET state = $1, version = version + 1, updated_at = $2, state_changed_at = $2
            WHERE id = $3 AND version = $4
            RETURNING {LISTING_COLUMNS}
            "#
        ))
        .bind(mutation.to_state.as_str())
        .bind(mutation.history.occurred_at)
        .bind(id.as_uuid())
        .bind(expected.value() as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_listing", e))?;

        let Some(row) = updated else {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM listings WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("read_version", e))?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(match actual {
                Some(actual) => StoreError::ConcurrencyConflict {
                    expected: expected.value(),
                    actual: actual as u64,
                },
                None => StoreError::NotFound(id),
            });
        };

        let listing = decode_listing(&row)?;

        insert_history(&mut tx, &mutation.history).await?;
        insert_outbox(&mut tx, &mutation.outbox).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(listing)
    }

    #[instrument(skip(self), fields(listing_id = %id), err)]
    async fn history(&self, id: ListingId) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT listing_id, sequence, from_state, to_state, reason, triggered_by, occurred_at
            FROM listing_history
            WHERE listing_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_history", e))?;

        if rows.is_empty() {
            // Every listing has a creation entry, so no rows means no listing.
            return Err(StoreError::NotFound(id));
        }

        rows.iter()
            .map(|row| {
                HistoryRow::from_row(row)
                    .map_err(|e| StoreError::Backend(format!("failed to decode history row: {e}")))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self), fields(result_count = tracing::field::Empty), err)]
    async fn search(&self, filter: ListingFilter) -> Result<ListingPage, StoreError> {
        let filter = filter.normalized();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM listings WHERE TRUE");
        push_filters(&mut count, &filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_listings", e))?;

        let mut select =
            QueryBuilder::<Postgres>::new(format!("SELECT {LISTING_COLUMNS} FROM listings WHERE TRUE"));
        push_filters(&mut select, &filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("search_listings", e))?;

        let listings = rows.iter().map(decode_listing).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("result_count", listings.len());

        Ok(ListingPage {
            listings,
            total: total as u64,
        })
    }

    #[instrument(skip(self, entry), fields(event_id = %entry.event_id), err)]
    async fn append_outbox(&self, entry: OutboxEntry) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        insert_outbox(&mut tx, &entry).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, event_id, listing_id, routing_key, payload, created_at, published_at
            FROM outbox
            WHERE published_at IS NULL
            ORDER BY created_at ASC, position ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        rows.iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map(OutboxEntry::from)
                    .map_err(|e| StoreError::Backend(format!("failed to decode outbox row: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn mark_published(
        &self,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET published_at = COALESCE(published_at, $2) WHERE event_id = $1",
        )
        .bind(event_id.as_uuid())
        .bind(published_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!("unknown outbox entry {event_id}")));
        }
        Ok(())
    }

    async fn outbox_backlog(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE published_at IS NULL")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("outbox_backlog", e))?;
        Ok(n as u64)
    }

    #[instrument(skip(self, entry), fields(brand = %entry.brand), err)]
    async fn add_rotation_entry(&self, entry: NewRotationEntry) -> Result<RotationEntry, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO search_rotation (brand, search_term, enabled)
            VALUES ($1, $2, $3)
            RETURNING {ROTATION_COLUMNS}
            "#
        ))
        .bind(&entry.brand)
        .bind(entry.search_term.as_deref())
        .bind(entry.enabled)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_rotation", e))?;

        decode_rotation(&row)
    }

    async fn rotation(&self) -> Result<Vec<RotationEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROTATION_COLUMNS} FROM search_rotation ORDER BY id ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_rotation", e))?;

        rows.iter().map(decode_rotation).collect()
    }

    #[instrument(skip(self), err)]
    async fn advance_rotation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<RotationSearch>, StoreError> {
        let mut tx = self.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {ROTATION_COLUMNS} FROM search_rotation ORDER BY id ASC FOR UPDATE"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_rotation", e))?;
        let entries = rows.iter().map(decode_rotation).collect::<Result<Vec<_>, _>>()?;

        let Some(next) = rotation::next_index(&entries) else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };
        let chosen = &entries[next];

        sqlx::query(
            r#"
            UPDATE search_rotation
            SET last_searched = (id = $1),
                last_searched_at = CASE WHEN id = $1 THEN $2 ELSE last_searched_at END,
                updated_at = $2
            WHERE id = $1 OR last_searched
            "#,
        )
        .bind(chosen.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("advance_rotation", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(Some(chosen.search()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &ListingFilter) {
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(brand) = &filter.brand {
        qb.push(" AND LOWER(brand) = LOWER(").push_bind(brand.clone()).push(")");
    }
    if let Some(product_id) = filter.product_id {
        qb.push(" AND product_id = ").push_bind(product_id);
    }
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    entry: &HistoryEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO listing_history (
            listing_id, sequence, from_state, to_state, reason, triggered_by, occurred_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.listing_id.as_uuid())
    .bind(entry.sequence as i64)
    .bind(entry.from_state.map(|s| s.as_str()))
    .bind(entry.to_state.as_str())
    .bind(entry.reason.as_deref())
    .bind(entry.triggered_by.to_string())
    .bind(entry.occurred_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_history", e))?;
    Ok(())
}

async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    entry: &OutboxEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox (event_id, listing_id, routing_key, payload, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(entry.event_id.as_uuid())
    .bind(entry.listing_id.map(Uuid::from))
    .bind(&entry.routing_key)
    .bind(&entry.payload)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_outbox", e))?;
    Ok(())
}

fn decode_listing(row: &sqlx::postgres::PgRow) -> Result<Listing, StoreError> {
    ListingRow::from_row(row)
        .map_err(|e| StoreError::Backend(format!("failed to decode listing row: {e}")))?
        .try_into()
}

fn decode_rotation(row: &sqlx::postgres::PgRow) -> Result<RotationEntry, StoreError> {
    let decode = || -> Result<RotationEntry, sqlx::Error> {
        Ok(RotationEntry {
            id: row.try_get("id")?,
            brand: row.try_get("brand")?,
            search_term: row.try_get("search_term")?,
            enabled: row.try_get("enabled")?,
            last_searched: row.try_get("last_searched")?,
            last_searched_at: row.try_get("last_searched_at")?,
        })
    };
    decode().map_err(|e| StoreError::Backend(format!("failed to decode rotation row: {e}")))
}

fn parse_state(raw: &str) -> Result<ListingState, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Backend(format!("unknown state in database: {raw}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::DuplicateListing(match db_err.constraint() {
                    Some(constraint) => format!("{constraint} violated in {operation}"),
                    None => msg,
                }),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct ListingRow {
    id: Uuid,
    product_id: i64,
    source_job_id: Uuid,
    brand: String,
    model: String,
    url: String,
    title: String,
    price: f64,
    confidence: f64,
    potential_profit: f64,
    state: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state_changed_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ListingRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ListingRow {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            source_job_id: row.try_get("source_job_id")?,
            brand: row.try_get("brand")?,
            model: row.try_get("model")?,
            url: row.try_get("url")?,
            title: row.try_get("title")?,
            price: row.try_get("price")?,
            confidence: row.try_get("confidence")?,
            potential_profit: row.try_get("potential_profit")?,
            state: row.try_get("state")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            state_changed_at: row.try_get("state_changed_at")?,
        })
    }
}

impl TryFrom<ListingRow> for Listing {
    type Error = StoreError;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        Ok(Listing::restore(
            ListingId::from_uuid(row.id),
            row.product_id,
            ScrapeJobId::from_uuid(row.source_job_id),
            row.brand,
            row.model,
            SourceAttributes {
                url: row.url,
                title: row.title,
                price: row.price,
                confidence: row.confidence,
                potential_profit: row.potential_profit,
            },
            parse_state(&row.state)?,
            row.version as u64,
            row.created_at,
            row.updated_at,
            row.state_changed_at,
        ))
    }
}

#[derive(Debug)]
struct HistoryRow {
    listing_id: Uuid,
    sequence: i64,
    from_state: Option<String>,
    to_state: String,
    reason: Option<String>,
    triggered_by: String,
    occurred_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for HistoryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(HistoryRow {
            listing_id: row.try_get("listing_id")?,
            sequence: row.try_get("sequence")?,
            from_state: row.try_get("from_state")?,
            to_state: row.try_get("to_state")?,
            reason: row.try_get("reason")?,
            triggered_by: row.try_get("triggered_by")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let triggered_by: Trigger = row
            .triggered_by
            .parse()
            .map_err(|_| StoreError::Backend(format!("unknown trigger: {}", row.triggered_by)))?;
        Ok(HistoryEntry {
            listing_id: ListingId::from_uuid(row.listing_id),
            sequence: row.sequence as u64,
            from_state: row.from_state.as_deref().map(parse_state).transpose()?,
            to_state: parse_state(&row.to_state)?,
            reason: row.reason,
            triggered_by,
            occurred_at: row.occurred_at,
        })
    }
}

#[derive(Debug)]
struct OutboxRow {
    position: i64,
    event_id: Uuid,
    listing_id: Option<Uuid>,
    routing_key: String,
    payload: JsonValue,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            position: row.try_get("position")?,
            event_id: row.try_get("event_id")?,
            listing_id: row.try_get("listing_id")?,
            routing_key: row.try_get("routing_key")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxEntry {
    fn from(row: OutboxRow) -> Self {
        OutboxEntry {
            event_id: EventId::from_uuid(row.event_id),
            listing_id: row.listing_id.map(ListingId::from_uuid),
            routing_key: row.routing_key,
            payload: row.payload,
            created_at: row.created_at,
            published_at: row.published_at,
            position: row.position as u64,
        }
    }
}

/// Run against a disposable database:
/// `DATABASE_URL=postgres://... cargo test -p aetos-infra -- --ignored`
#[cfg(test)]
mod tests {
    use super::*;

    use aetos_lifecycle::NewListing;

    async fn store() -> Option<PostgresLifecycleStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresLifecycleStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    fn creation(job: ScrapeJobId, product_id: i64, url: &str) -> ListingCreation {
        let new = NewListing {
            product_id,
            source_job_id: job,
            brand: "Mamiya".into(),
            model: "RB67".into(),
            source: SourceAttributes {
                url: url.into(),
                title: "Mamiya RB67 Pro S".into(),
                price: 450.0,
                confidence: 82.0,
                potential_profit: 150.0,
            },
        };
        ListingCreation::new(new, Trigger::ScraperWebhook, Utc::now()).unwrap()
    }

    fn unique_url() -> String {
        format!("https://marketplace.test/{}", Uuid::now_v7())
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn active_duplicate_and_ingestion_replay_map_to_duplicate_listing() {
        let Some(store) = store().await else { return };
        let url = unique_url();
        let job = ScrapeJobId::new();
        store.create(creation(job, 67, &url)).await.unwrap();

        let replay = store.create(creation(job, 67, &url)).await.unwrap_err();
        assert!(matches!(replay, StoreError::DuplicateListing(_)), "{replay:?}");

        let other_job = store.create(creation(ScrapeJobId::new(), 67, &url)).await.unwrap_err();
        assert!(matches!(other_job, StoreError::DuplicateListing(_)), "{other_job:?}");
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_version_update_maps_to_concurrency_conflict() {
        let Some(store) = store().await else { return };
        let id = store
            .create(creation(ScrapeJobId::new(), 68, &unique_url()))
            .await
            .unwrap();
        let listing = store.get(id).await.unwrap();
        let mutation = |to| {
            let plan = listing
                .plan_transition(to, None, Trigger::System, Utc::now())
                .unwrap();
            ListingMutation::from_transition(plan).unwrap()
        };

        store
            .compare_and_update(id, ExpectedVersion::exact(1), mutation(ListingState::Messaging))
            .await
            .unwrap();
        let err = store
            .compare_and_update(id, ExpectedVersion::exact(1), mutation(ListingState::Cancelled))
            .await
            .unwrap_err();

        assert!(
            matches!(err, StoreError::ConcurrencyConflict { expected: 1, actual: 2 }),
            "{err:?}"
        );
        assert_eq!(store.history(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn rotation_reaches_a_newly_added_entry() {
        let Some(store) = store().await else { return };
        let brand = format!("Brand-{}", Uuid::now_v7());
        store
            .add_rotation_entry(NewRotationEntry {
                brand: brand.clone(),
                search_term: None,
                enabled: true,
            })
            .await
            .unwrap();

        let steps = store.rotation().await.unwrap().len();
        let mut reached = false;
        for _ in 0..steps {
            let search = store.advance_rotation(Utc::now()).await.unwrap().unwrap();
            if search.brand == brand {
                assert_eq!(search.search_term, brand);
                reached = true;
                break;
            }
        }
        assert!(reached);

        let marked: Vec<_> = store
            .rotation()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.last_searched)
            .collect();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].brand, brand);
    }
}
