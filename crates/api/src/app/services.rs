use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::info;

use aetos_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use aetos_infra::config::OrchestratorConfig;
use aetos_infra::coordinators::{
    Coordinator, CoordinatorDispatcher, DispatchHandle, HttpStepCoordinator, PendingCoordinator,
    ScraperClient,
};
use aetos_infra::event_bus::RedisStreamsEventBus;
use aetos_infra::ingestion::IngestionProcessor;
use aetos_infra::outbox::{Relay, RelayHandle};
use aetos_infra::scrape::{ScheduleHandle, ScrapeLauncher, ScrapeScheduler};
use aetos_infra::store::{InMemoryLifecycleStore, LifecycleStore, PostgresLifecycleStore};
use aetos_infra::transition::TransitionEngine;
use aetos_lifecycle::ListingState;

pub type SharedStore = Arc<dyn LifecycleStore>;
pub type Envelope = EventEnvelope<JsonValue>;

/// Consumer group the dispatch worker reads through on Redis.
const DISPATCH_GROUP: &str = "coordinator.dispatch";

/// The configured broker.
pub enum Broker {
    Memory(Arc<InMemoryEventBus<Envelope>>),
    Redis(RedisStreamsEventBus),
}

#[derive(Debug, thiserror::Error)]
#[error("broker publish failed: {0}")]
pub struct BrokerError(String);

#[async_trait]
impl EventBus<Envelope> for Broker {
    type Error = BrokerError;

    async fn publish(&self, message: Envelope) -> Result<(), Self::Error> {
        match self {
            Broker::Memory(bus) => bus.publish(message).await.map_err(|e| BrokerError(e.to_string())),
            Broker::Redis(bus) => bus.publish(message).await.map_err(|e| BrokerError(e.to_string())),
        }
    }

    fn subscribe(&self) -> Subscription<Envelope> {
        match self {
            Broker::Memory(bus) => bus.subscribe(),
            Broker::Redis(bus) => bus.subscribe_with_group(DISPATCH_GROUP, "aetos-api"),
        }
    }

    async fn acknowledge(&self, message: &Envelope) -> Result<(), Self::Error> {
        match self {
            Broker::Memory(bus) => bus.acknowledge(message).await.map_err(|e| BrokerError(e.to_string())),
            Broker::Redis(bus) => bus.acknowledge(message).await.map_err(|e| BrokerError(e.to_string())),
        }
    }
}

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub store: SharedStore,
    pub engine: Arc<TransitionEngine<SharedStore>>,
    pub ingestion: IngestionProcessor<SharedStore>,
    /// Starts scrapes for the admin trigger and the schedule.
    pub launcher: Arc<ScrapeLauncher<SharedStore>>,
    pub dispatcher: Arc<CoordinatorDispatcher<SharedStore>>,
    /// `postgres` or `memory`.
    pub backend: &'static str,
}

impl AppServices {
    pub fn new(config: &OrchestratorConfig, store: SharedStore, backend: &'static str) -> Self {
        let engine = Arc::new(TransitionEngine::new(store.clone(), config.transition.clone()));

        let negotiation: Arc<dyn Coordinator> = match &config.chatterbot_url {
            Some(url) => Arc::new(HttpStepCoordinator::new("chatterbot", url, "/conversations")),
            None => Arc::new(PendingCoordinator::new(
                "chatterbot",
                "negotiation bot integration not configured",
            )),
        };
        let resale: Arc<dyn Coordinator> = match &config.ebay_url {
            Some(url) => Arc::new(HttpStepCoordinator::new("ebay", url, "/listings")),
            None => Arc::new(PendingCoordinator::new(
                "ebay",
                "resale listing integration not configured",
            )),
        };

        let dispatcher = Arc::new(
            CoordinatorDispatcher::new(engine.clone(), config.dispatch.clone())
                .route(ListingState::Messaging, negotiation)
                .route(ListingState::Received, resale),
        );

        Self {
            ingestion: IngestionProcessor::new(store.clone()),
            launcher: Arc::new(ScrapeLauncher::new(
                store.clone(),
                ScraperClient::new(&config.scraper_url, config.scraper_api_key.clone()),
                config.scrape_poll.clone(),
            )),
            store,
            engine,
            dispatcher,
            backend,
        }
    }
}

/// Services plus the background relay, dispatch, and scrape schedule workers.
pub struct Orchestrator {
    services: Arc<AppServices>,
    relay: RelayHandle,
    dispatch: DispatchHandle,
    schedule: Option<ScheduleHandle>,
}

impl Orchestrator {
    /// Connect the store and broker from `config` and start the workers.
    pub async fn start(config: &OrchestratorConfig) -> anyhow::Result<Self> {
        let (store, backend): (SharedStore, &'static str) = match &config.database_url {
            Some(url) => {
                let pg = PostgresLifecycleStore::connect(url).await?;
                pg.migrate().await?;
                (Arc::new(pg), "postgres")
            }
            None => (Arc::new(InMemoryLifecycleStore::new()), "memory"),
        };

        let broker = Arc::new(match &config.redis_url {
            Some(url) => Broker::Redis(RedisStreamsEventBus::new(url, None)?),
            None => Broker::Memory(Arc::new(InMemoryEventBus::new())),
        });

        let services = Arc::new(AppServices::new(config, store, backend));

        // Subscribe before the relay publishes anything.
        let dispatch = services.dispatcher.clone().spawn(broker.clone());
        let relay = Relay::new(services.store.clone(), broker, config.relay.clone()).spawn();
        let schedule = config
            .scrape_schedule
            .clone()
            .map(|schedule| ScrapeScheduler::new(services.launcher.clone(), schedule).spawn());

        info!(backend, scheduled_scrapes = schedule.is_some(), "orchestrator started");
        Ok(Self {
            services,
            relay,
            dispatch,
            schedule,
        })
    }

    pub fn services(&self) -> Arc<AppServices> {
        self.services.clone()
    }

    /// Stop starting scrapes, then stop the relay so nothing new reaches
    /// dispatch, then drain dispatch.
    pub async fn shutdown(self) {
        if let Some(schedule) = self.schedule {
            schedule.shutdown().await;
        }
        self.services.launcher.stop_polling();
        self.relay.shutdown().await;
        self.dispatch.shutdown().await;
        info!("orchestrator stopped");
    }
}
