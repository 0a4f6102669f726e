//! Infrastructure layer: listing store, outbox relay, transition engine,
//! ingestion, coordinator dispatch, scrape scheduling, brokers, and
//! configuration.

pub mod config;
pub mod coordinators;
pub mod event_bus;
pub mod ingestion;
pub mod outbox;
pub mod retry;
pub mod scrape;
pub mod store;
pub mod transition;


pub use config::OrchestratorConfig;
pub use ingestion::{IngestError, IngestOutcome, IngestionProcessor, ScrapeBatch, ScrapeMatch};
pub use outbox::{OutboxEntry, Relay, RelayConfig, RelayHandle};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scrape::{LaunchError, LaunchedScrape, PollConfig, Schedule, ScrapeLauncher, ScrapeScheduler};
pub use store::{InMemoryLifecycleStore, LifecycleStore, PostgresLifecycleStore, StoreError};
pub use transition::{
    FailureReason, TransitionConfig, TransitionEngine, TransitionError, TransitionRequest,
};
