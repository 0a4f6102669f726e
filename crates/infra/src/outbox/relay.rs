//! Outbox relay: forwards unpublished outbox entries to the broker.
//!
//! An entry is marked published only after the broker acknowledged it. A crash
//! between the acknowledgement and the mark republishes the entry on the next
//! pass, so consumers see each event at least once and must de-duplicate by
//! `event_id`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use aetos_events::{EventBus, EventEnvelope};

use crate::retry::RetryPolicy;
use crate::store::{LifecycleStore, StoreError};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Entries fetched per pass.
    pub batch_size: usize,
    /// Idle wait between passes once the outbox is drained.
    pub poll_interval: Duration,
    /// Wait between passes after consecutive failures.
    pub backoff: RetryPolicy,
    /// Name for logging
    pub name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            backoff: RetryPolicy::unbounded(Duration::from_millis(250), Duration::from_secs(30)),
            name: "outbox-relay".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("publish failed for event {event_id}: {message}")]
    Publish { event_id: String, message: String },
}

/// Result of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    /// The pass fetched a full batch; more entries are probably waiting.
    pub batch_full: bool,
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RelayStats {
    pub passes: u64,
    pub published: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Moves outbox entries onto an [`EventBus`].
pub struct Relay<S, B> {
    store: S,
    bus: B,
    config: RelayConfig,
}

impl<S, B> Relay<S, B>
where
    S: LifecycleStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, bus: B, config: RelayConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Publish one batch of pending entries in outbox order.
    ///
    /// Stops at the first publish failure so later entries are not delivered
    /// ahead of an earlier one.
    #[instrument(skip(self), fields(relay = %self.config.name), err)]
    pub async fn drain_once(&self) -> Result<DrainReport, RelayError> {
        let pending = self.store.pending_outbox(self.config.batch_size).await?;
        let batch_full = pending.len() >= self.config.batch_size;

        let mut published = 0;
        for entry in pending {
            self.bus
                .publish(entry.to_envelope())
                .await
                .map_err(|err| RelayError::Publish {
                    event_id: entry.event_id.to_string(),
                    message: err.to_string(),
                })?;

            self.store.mark_published(entry.event_id, Utc::now()).await?;
            published += 1;

            debug!(
                event_id = %entry.event_id,
                routing_key = %entry.routing_key,
                "outbox entry published"
            );
        }

        Ok(DrainReport {
            published,
            batch_full,
        })
    }
}

impl<S, B> Relay<S, B>
where
    S: LifecycleStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    /// Run the relay on a background task until [`RelayHandle::shutdown`].
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(RelayStats::default()));
        let join = tokio::spawn(relay_loop(self, shutdown_rx, stats.clone()));

        RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

/// Handle to control a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "outbox relay task panicked");
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

async fn relay_loop<S, B>(
    relay: Relay<S, B>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<RelayStats>>,
) where
    S: LifecycleStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    let name = relay.config.name.clone();
    info!(relay = %name, "outbox relay started");

    let mut consecutive_failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match relay.drain_once().await {
            Ok(report) => {
                consecutive_failures = 0;
                {
                    let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
                    s.passes += 1;
                    s.published += report.published as u64;
                    s.consecutive_failures = 0;
                }
                if report.batch_full {
                    Duration::ZERO
                } else {
                    relay.config.poll_interval
                }
            }
            Err(err) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let delay = relay.config.backoff.delay_for_attempt(consecutive_failures);
                warn!(
                    relay = %name,
                    error = %err,
                    consecutive_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "outbox relay pass failed"
                );
                {
                    let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
                    s.passes += 1;
                    s.failures += 1;
                    s.consecutive_failures = consecutive_failures;
                    s.last_error = Some(err.to_string());
                }
                delay
            }
        };

        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                // Handle dropped without an explicit shutdown.
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(relay = %name, "outbox relay stopped");
}
