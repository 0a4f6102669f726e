//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the **transport layer** for events after they've been committed to
//! the outbox:
//!
//! ```text
//! Transition → Store (state + history + outbox) → Relay → EventBus → Consumers
//!                                                                     ├─ Coordinator dispatch
//!                                                                     └─ External services
//! ```
//!
//! ## Delivery Guarantees
//!
//! The bus provides **at-least-once delivery**:
//! - the relay republishes anything it could not mark as delivered,
//! - events for different listings may arrive in any order,
//! - consumers must de-duplicate by `event_id` (see [`crate::Deduplicator`]).
//!
//! `publish()` resolves only once the broker has acknowledged the message. An
//! `Err` means the message may or may not have been accepted; the relay retries.
//! On the consuming side, `acknowledge()` is called once a message has been
//! fully handled; durable brokers redeliver anything left unacknowledged.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Dropping it unregisters the subscriber on the
/// next publish.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    /// Confirm that a message received through [`EventBus::subscribe`] has been
    /// processed. Brokers that redeliver unconfirmed messages (after a consumer
    /// restart) must not forget the message before this is called. Brokers
    /// without redelivery keep the default no-op.
    async fn acknowledge(&self, _message: &M) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + Sync + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message).await
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    async fn acknowledge(&self, message: &M) -> Result<(), Self::Error> {
        (**self).acknowledge(message).await
    }
}
