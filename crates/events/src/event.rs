use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **routable**: `event_type` doubles as the broker routing key
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable routing key (e.g. "listing.created", "listing.state.messaging").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
