//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! - **Publish**: `XADD` to one stream; resolves once Redis confirmed the write,
//!   which is the acknowledgement the outbox relay waits for.
//! - **Subscribe**: each subscription reads through a consumer group with
//!   `XREADGROUP` and forwards envelopes in stream order. On start it first
//!   replays its own pending entries (read from `0`), i.e. entries a previous
//!   run received but never confirmed.
//! - **Acknowledge**: an entry is `XACK`ed only when the consumer calls
//!   [`EventBus::acknowledge`] for it, after handling it.
//! - Entries carry `event_id` and `routing_key` as stream fields so other
//!   tooling can filter without decoding the payload.
//!
//! ## Keys
//!
//! - **Stream Key**: `orchestrator.events` (the logical exchange)
//! - **Consumer Groups**: one per consumer type (e.g. `coordinator.dispatch`)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use aetos_core::EventId;
use aetos_events::{EXCHANGE, EventBus, EventEnvelope, Subscription};

const DEFAULT_GROUP: &str = "orchestrator";
/// Stable so a restarted process finds its own pending entries again.
const DEFAULT_CONSUMER: &str = "primary";
const READ_COUNT: usize = 32;
const BLOCK_MS: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Stream entries delivered to this process and not yet acknowledged, by
/// event, in delivery order.
type Unacked = HashMap<EventId, Vec<(String, String)>>;

#[derive(Debug, Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_key: String,
    unacked: Arc<Mutex<Unacked>>,
}

impl RedisStreamsEventBus {
    /// `stream_key` defaults to [`EXCHANGE`].
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| EXCHANGE.to_string()),
            unacked: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisStreamsError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Create the consumer group (and the stream) if missing.
    pub async fn ensure_consumer_group(&self, group: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection().await?;
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Subscribe through a named consumer group.
    ///
    /// Consumers sharing a group split the stream between them; distinct groups
    /// each see every entry. `consumer` must be stable across restarts for
    /// pending entries to be replayed.
    pub fn subscribe_with_group(
        &self,
        group: &str,
        consumer: &str,
    ) -> Subscription<EventEnvelope<JsonValue>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = self.clone();
        let group = group.to_string();
        let consumer = consumer.to_string();

        tokio::spawn(async move {
            if let Err(e) = bus.ensure_consumer_group(&group).await {
                error!(%group, error = %e, "failed to create consumer group");
            }

            // Entries received by an earlier run but never acknowledged.
            let mut cursor = "0".to_string();
            loop {
                match bus.read_batch(&group, &consumer, &cursor).await {
                    Ok(entries) if entries.is_empty() => break,
                    Ok(entries) => {
                        if let Some((last, _)) = entries.last() {
                            cursor = last.clone();
                        }
                        info!(%group, replayed = entries.len(), "replaying pending stream entries");
                        if !bus.forward(&group, entries, &tx).await {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(%group, error = %e, "failed to read pending entries");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            loop {
                if tx.is_closed() {
                    return;
                }
                match bus.read_batch(&group, &consumer, ">").await {
                    Ok(entries) => {
                        if !bus.forward(&group, entries, &tx).await {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(%group, error = %e, "failed to read from stream");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Subscription::new(rx)
    }

    /// Hand entries to the consumer. Undecodable entries are acknowledged right
    /// away; the rest wait for [`EventBus::acknowledge`]. Returns `false` once
    /// the consumer is gone.
    async fn forward(
        &self,
        group: &str,
        entries: Vec<(String, Option<EventEnvelope<JsonValue>>)>,
        tx: &mpsc::UnboundedSender<EventEnvelope<JsonValue>>,
    ) -> bool {
        let mut dropped = Vec::new();
        for (id, envelope) in entries {
            let Some(envelope) = envelope else {
                dropped.push(id);
                continue;
            };
            self.unacked
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .entry(envelope.event_id())
                .or_default()
                .push((group.to_string(), id));
            if tx.send(envelope).is_err() {
                return false;
            }
        }
        if let Err(e) = self.ack_entries(group, &dropped).await {
            warn!(%group, error = %e, "XACK of undecodable entries failed");
        }
        true
    }

    /// `cursor` is `>` for new entries or a stream id to page through this
    /// consumer's pending entries.
    async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        cursor: &str,
    ) -> Result<Vec<(String, Option<EventEnvelope<JsonValue>>)>, RedisStreamsError> {
        let mut conn = self.connection().await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(READ_COUNT)
            .block(BLOCK_MS);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[cursor], &options)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let envelope = decode_entry(&entry.map);
                if envelope.is_none() {
                    warn!(message_id = %entry.id, "undecodable stream entry acknowledged and dropped");
                }
                entries.push((entry.id, envelope));
            }
        }
        Ok(entries)
    }

    async fn ack_entries(&self, group: &str, ids: &[String]) -> Result<(), RedisStreamsError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: u64 = conn
            .xack(&self.stream_key, group, ids)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

fn decode_entry(fields: &HashMap<String, redis::Value>) -> Option<EventEnvelope<JsonValue>> {
    let payload: String = redis::from_redis_value(fields.get("payload")?).ok()?;
    serde_json::from_str(&payload).ok()
}

#[async_trait]
impl EventBus<EventEnvelope<JsonValue>> for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    #[instrument(
        skip(self, message),
        fields(
            stream_key = %self.stream_key,
            event_id = %message.event_id(),
            routing_key = message.routing_key()
        ),
        err
    )]
    async fn publish(&self, message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let event_id = message.event_id().to_string();

        let mut conn = self.connection().await?;
        let id: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[
                    ("event_id", event_id.as_str()),
                    ("routing_key", message.routing_key()),
                    ("payload", payload.as_str()),
                ],
            )
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        debug!(message_id = %id, "event appended to stream");
        Ok(())
    }

    /// Joins the default consumer group.
    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.subscribe_with_group(DEFAULT_GROUP, DEFAULT_CONSUMER)
    }

    /// `XACK`s one delivered entry of this event. A relay republish delivers
    /// the same event twice; each delivery is acknowledged separately, so an
    /// entry still being handled stays pending until its own acknowledgement.
    async fn acknowledge(&self, message: &EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        let entry = {
            let mut unacked = self.unacked.lock().unwrap_or_else(|p| p.into_inner());
            let event_id = message.event_id();
            let entry = unacked.get_mut(&event_id).and_then(|entries| {
                (!entries.is_empty()).then(|| entries.remove(0))
            });
            if unacked.get(&event_id).is_some_and(Vec::is_empty) {
                unacked.remove(&event_id);
            }
            entry
        };

        match entry {
            Some((group, id)) => self.ack_entries(&group, &[id]).await,
            None => Ok(()),
        }
    }
}

/// Run against a disposable Redis:
/// `REDIS_URL=redis://... cargo test -p aetos-infra --features redis -- --ignored`
#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use serde_json::json;

    fn bus(url: &str, stream: &str) -> RedisStreamsEventBus {
        RedisStreamsEventBus::new(url, Some(stream.to_string())).unwrap()
    }

    async fn next(sub: &mut Subscription<EventEnvelope<JsonValue>>) -> Option<EventEnvelope<JsonValue>> {
        tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn unacknowledged_entries_are_replayed_to_the_same_consumer() {
        let Ok(url) = std::env::var("REDIS_URL") else { return };
        let stream = format!("aetos.test.{}", EventId::new());
        let envelope = EventEnvelope::new(
            EventId::new(),
            "listing.state_changed",
            None,
            Utc::now(),
            json!({"to": "MESSAGING"}),
        );

        let first = bus(&url, &stream);
        first.ensure_consumer_group("dispatch").await.unwrap();
        first.publish(envelope.clone()).await.unwrap();
        let mut sub = first.subscribe_with_group("dispatch", "worker-1");
        assert_eq!(next(&mut sub).await.unwrap().event_id(), envelope.event_id());
        drop(sub);

        // A restarted process with the same consumer name sees it again.
        let restarted = bus(&url, &stream);
        let mut sub = restarted.subscribe_with_group("dispatch", "worker-1");
        let replayed = next(&mut sub).await.unwrap();
        assert_eq!(replayed.event_id(), envelope.event_id());
        restarted.acknowledge(&replayed).await.unwrap();
        drop(sub);

        let after_ack = bus(&url, &stream);
        let mut sub = after_ack.subscribe_with_group("dispatch", "worker-1");
        assert!(next(&mut sub).await.is_none());
    }
}
