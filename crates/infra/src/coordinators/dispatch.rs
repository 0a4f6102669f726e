//! Coordinator dispatch: reacts to committed state changes by calling the
//! coordinator registered for the destination state.
//!
//! ```text
//! EventBus ─► dedupe(event_id) ─► StateChanged{to} ─► Coordinator for `to`
//!                                                      ├─ Success   → record
//!                                                      ├─ Pending   → record, listing stays parked
//!                                                      ├─ Retryable → backoff + retry (timeout and
//!                                                      │              open circuit count here)
//!                                                      └─ Terminal / retries exhausted
//!                                                           → CANCELLED, or dead-letter when the
//!                                                             graph forbids cancelling
//! ```
//!
//! Dispatch only ever changes listing state through the transition engine.
//! A message is acknowledged to the bus only once it reached one of the
//! outcomes above (or needed no step). When the listing cannot be loaded the
//! message stays unacknowledged and is retried with backoff.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use aetos_core::{EventId, ListingId};
use aetos_events::{Deduplicator, EventBus, EventEnvelope};
use aetos_lifecycle::{LifecycleEvent, ListingState, Trigger};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use super::{Coordinator, StepOutcome};
use crate::retry::RetryPolicy;
use crate::store::{LifecycleStore, StoreError};
use crate::transition::{TransitionEngine, TransitionError, TransitionRequest};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts per step and the backoff between them.
    pub retry: RetryPolicy,
    /// Bound on a single coordinator attempt. Expiry counts as a retryable
    /// failure.
    pub attempt_timeout: Duration,
    /// Applied to each coordinator separately.
    pub breaker: CircuitBreakerConfig,
    /// Steps running at the same time.
    pub max_concurrency: usize,
    pub dedup_capacity: usize,
    /// Records kept by [`CoordinatorDispatcher::dispatch_log`]; oldest evicted first.
    pub log_capacity: usize,
    /// Backoff while a message cannot be handled (store unavailable). Never gives up.
    pub redelivery: RetryPolicy,
    /// Name for logging
    pub name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
            max_concurrency: 8,
            dedup_capacity: Deduplicator::DEFAULT_CAPACITY,
            log_capacity: 1_000,
            redelivery: RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(30)),
            name: "coordinator-dispatch".to_string(),
        }
    }
}

/// How a dispatched step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum DispatchResolution {
    Succeeded { attempts: u32 },
    Pending { reason: String },
    /// The listing was moved to `CANCELLED`.
    Cancelled { attempts: u32, reason: String },
    /// The step failed but the listing could not be cancelled.
    DeadLettered { attempts: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    pub event_id: EventId,
    pub listing_id: ListingId,
    pub coordinator: String,
    pub state: ListingState,
    #[serde(flatten)]
    pub resolution: DispatchResolution,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub received: u64,
    pub duplicates: u64,
    pub attempts: u64,
    pub succeeded: u64,
    pub pending: u64,
    pub cancelled: u64,
    pub dead_lettered: u64,
    /// Handling attempts put off because the listing could not be loaded.
    pub deferred: u64,
}

/// A message that could not be handled now and must be delivered again.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("listing {listing_id} could not be loaded: {source}")]
    ListingUnavailable {
        listing_id: ListingId,
        source: StoreError,
    },
}

struct Route {
    coordinator: Arc<dyn Coordinator>,
    breaker: CircuitBreaker,
}

/// Routes `StateChanged` events to coordinators.
pub struct CoordinatorDispatcher<S> {
    engine: Arc<TransitionEngine<S>>,
    routes: HashMap<ListingState, Route>,
    config: DispatchConfig,
    dedup: Mutex<Deduplicator>,
    log: Mutex<VecDeque<DispatchRecord>>,
    stats: Arc<Mutex<DispatchStats>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S> CoordinatorDispatcher<S>
where
    S: LifecycleStore + 'static,
{
    pub fn new(engine: Arc<TransitionEngine<S>>, config: DispatchConfig) -> Self {
        let dedup = Deduplicator::new(config.dedup_capacity);
        Self {
            engine,
            routes: HashMap::new(),
            config,
            dedup: Mutex::new(dedup),
            log: Mutex::new(VecDeque::new()),
            stats: Arc::new(Mutex::new(DispatchStats::default())),
        }
    }

    /// Call `coordinator` whenever a listing enters `state`.
    pub fn route(mut self, state: ListingState, coordinator: Arc<dyn Coordinator>) -> Self {
        let breaker = CircuitBreaker::new(coordinator.name(), self.config.breaker.clone());
        self.routes.insert(state, Route { coordinator, breaker });
        self
    }

    pub fn routed_states(&self) -> Vec<ListingState> {
        let mut states: Vec<_> = self.routes.keys().copied().collect();
        states.sort_by_key(|s| ListingState::ALL.iter().position(|x| x == s));
        states
    }

    /// The most recent records, oldest first.
    pub fn dispatch_log(&self) -> Vec<DispatchRecord> {
        lock(&self.log).iter().cloned().collect()
    }

    pub fn stats(&self) -> DispatchStats {
        lock(&self.stats).clone()
    }

    /// Process one broker message. Returns the record of the step it ran, or
    /// `None` when the message needed no step.
    ///
    /// On `Err` the message is not remembered as seen, so a redelivery runs it.
    pub async fn handle(
        &self,
        envelope: EventEnvelope<JsonValue>,
    ) -> Result<Option<DispatchRecord>, DispatchError> {
        lock(&self.stats).received += 1;
        let event_id = envelope.event_id();

        if !lock(&self.dedup).first_delivery(event_id) {
            lock(&self.stats).duplicates += 1;
            debug!(%event_id, "duplicate delivery dropped");
            return Ok(None);
        }

        let event = match envelope.decode::<LifecycleEvent>() {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    event_id = %envelope.event_id(),
                    routing_key = envelope.routing_key(),
                    error = %err,
                    "undecodable event skipped"
                );
                return Ok(None);
            }
        };

        let LifecycleEvent::StateChanged { listing_id, to, .. } = event else {
            return Ok(None);
        };
        let Some(route) = self.routes.get(&to) else {
            return Ok(None);
        };

        let resolution = match self.run_step(route, listing_id, to).await {
            Ok(Some(resolution)) => resolution,
            Ok(None) => return Ok(None),
            Err(err) => {
                lock(&self.dedup).forget(event_id);
                lock(&self.stats).deferred += 1;
                return Err(err);
            }
        };
        let record = DispatchRecord {
            event_id,
            listing_id,
            coordinator: route.coordinator.name().to_string(),
            state: to,
            resolution,
            recorded_at: Utc::now(),
        };

        {
            let mut stats = lock(&self.stats);
            match &record.resolution {
                DispatchResolution::Succeeded { .. } => stats.succeeded += 1,
                DispatchResolution::Pending { .. } => stats.pending += 1,
                DispatchResolution::Cancelled { .. } => stats.cancelled += 1,
                DispatchResolution::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        {
            let mut log = lock(&self.log);
            log.push_back(record.clone());
            while log.len() > self.config.log_capacity.max(1) {
                log.pop_front();
            }
        }
        Ok(Some(record))
    }

    #[instrument(
        skip(self, route),
        fields(coordinator = route.coordinator.name())
    )]
    async fn run_step(
        &self,
        route: &Route,
        listing_id: ListingId,
        state: ListingState,
    ) -> Result<Option<DispatchResolution>, DispatchError> {
        let listing = match self.engine.store().get(listing_id).await {
            Ok(listing) => listing,
            Err(StoreError::NotFound(_)) => {
                warn!(%listing_id, "event for unknown listing skipped");
                return Ok(None);
            }
            Err(source) => return Err(DispatchError::ListingUnavailable { listing_id, source }),
        };
        if listing.state() != state {
            debug!(%listing_id, current = %listing.state(), "listing moved on; step skipped");
            return Ok(None);
        }

        let name = route.coordinator.name().to_string();
        let timeout = self.config.attempt_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            lock(&self.stats).attempts += 1;

            let result = route
                .breaker
                .call(|| async {
                    match tokio::time::timeout(timeout, route.coordinator.attempt_step(&listing))
                        .await
                    {
                        Ok(StepOutcome::Retryable(msg)) => Err(msg),
                        Ok(outcome) => Ok(outcome),
                        Err(_) => Err(format!("attempt timed out after {}ms", timeout.as_millis())),
                    }
                })
                .await;

            let failure = match result {
                Ok(StepOutcome::Success) => {
                    info!(%listing_id, attempts = attempt, "coordinator step succeeded");
                    return Ok(Some(DispatchResolution::Succeeded { attempts: attempt }));
                }
                Ok(StepOutcome::Pending { reason }) => {
                    info!(%listing_id, %reason, "coordinator step pending");
                    return Ok(Some(DispatchResolution::Pending { reason }));
                }
                Ok(StepOutcome::Terminal(msg)) => {
                    let reason = format!("{name} rejected the step: {msg}");
                    return Ok(Some(self.cancel(listing_id, &name, attempt, reason).await));
                }
                Ok(StepOutcome::Retryable(msg)) | Err(CircuitBreakerError::Inner(msg)) => msg,
                Err(CircuitBreakerError::Open) => "circuit open".to_string(),
            };

            if !self.config.retry.should_retry(attempt) {
                let reason = format!("{name} failed after {attempt} attempts: {failure}");
                return Ok(Some(self.cancel(listing_id, &name, attempt, reason).await));
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            warn!(
                %listing_id,
                attempt,
                error = %failure,
                retry_in_ms = delay.as_millis() as u64,
                "coordinator attempt failed"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn cancel(
        &self,
        listing_id: ListingId,
        coordinator: &str,
        attempts: u32,
        reason: String,
    ) -> DispatchResolution {
        let request = TransitionRequest::new(
            listing_id,
            ListingState::Cancelled,
            Trigger::coordinator(coordinator),
        )
        .with_reason(reason.clone());

        match self.engine.transition(request).await {
            Ok(_) => {
                warn!(%listing_id, %reason, "listing cancelled after coordinator failure");
                DispatchResolution::Cancelled { attempts, reason }
            }
            Err(err) => {
                let detail = match &err {
                    TransitionError::InvalidTransition { current, .. } => {
                        format!("{reason}; cannot cancel from {current}")
                    }
                    other => format!("{reason}; cancel failed: {other}"),
                };
                error!(%listing_id, reason = %detail, "coordinator failure dead-lettered");
                DispatchResolution::DeadLettered {
                    attempts,
                    reason: detail,
                }
            }
        }
    }

    /// Handle one message until it is resolved, then acknowledge it. Gives up
    /// without acknowledging on shutdown, leaving it for redelivery.
    async fn deliver<B>(
        &self,
        bus: &B,
        envelope: EventEnvelope<JsonValue>,
        shutdown: &mut watch::Receiver<bool>,
    ) where
        B: EventBus<EventEnvelope<JsonValue>> + ?Sized,
    {
        let mut failures: u32 = 0;
        loop {
            match self.handle(envelope.clone()).await {
                Ok(_) => {
                    if let Err(err) = bus.acknowledge(&envelope).await {
                        warn!(event_id = %envelope.event_id(), error = %err, "acknowledge failed");
                    }
                    return;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.redelivery.delay_for_attempt(failures);
                    warn!(
                        event_id = %envelope.event_id(),
                        error = %err,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "dispatch deferred"
                    );
                    if *shutdown.borrow() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Consume `bus` on a background task until [`DispatchHandle::shutdown`].
    pub fn spawn<B>(self: Arc<Self>, bus: Arc<B>) -> DispatchHandle
    where
        B: EventBus<EventEnvelope<JsonValue>> + ?Sized + 'static,
    {
        let mut subscription = bus.subscribe();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let permits = self.config.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let stats = self.stats.clone();
        let name = self.config.name.clone();

        let join = tokio::spawn(async move {
            info!(dispatcher = %name, routes = ?self.routed_states(), "dispatch started");
            loop {
                let envelope = tokio::select! {
                    message = subscription.recv() => match message {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let dispatcher = self.clone();
                let bus = bus.clone();
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    dispatcher.deliver(bus.as_ref(), envelope, &mut shutdown).await;
                    drop(permit);
                });
            }

            // Wait for in-flight steps.
            let _ = semaphore.acquire_many(permits as u32).await;
            info!(dispatcher = %name, "dispatch stopped");
        });

        DispatchHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

#[derive(Debug)]
pub struct DispatchHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatchStats>>,
}

impl DispatchHandle {
    /// Stop consuming and wait for in-flight steps to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "dispatch task panicked");
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        lock(&self.stats).clone()
    }
}
