//! Event plumbing shared by the orchestrator: the [`Event`] contract, the
//! broker-level [`EventEnvelope`], the [`EventBus`] abstraction, and consumer
//! side de-duplication.

pub mod bus;
pub mod dedup;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use dedup::Deduplicator;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};

/// Logical exchange every lifecycle event is published to.
pub const EXCHANGE: &str = "orchestrator.events";
