//! Consumer-side de-duplication by `event_id`.

use std::collections::{HashSet, VecDeque};

use aetos_core::EventId;

/// Remembers the most recent `capacity` event ids a consumer has processed.
///
/// Delivery is at-least-once, so a consumer runs every envelope through
/// [`Deduplicator::first_delivery`] and drops the ones it has already seen.
/// Eviction is FIFO; redeliveries older than the window are processed again, so
/// size the window above the relay's worst-case replay batch.
#[derive(Debug)]
pub struct Deduplicator {
    capacity: usize,
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl Deduplicator {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns `true` the first time an id is seen, `false` for duplicates.
    pub fn first_delivery(&mut self, event_id: EventId) -> bool {
        if !self.seen.insert(event_id) {
            return false;
        }
        self.order.push_back(event_id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    /// Drop `event_id` from the window so its next delivery is processed.
    /// Used when handling failed after the id was recorded.
    pub fn forget(&mut self, event_id: EventId) {
        if self.seen.remove(&event_id) {
            self.order.retain(|id| *id != event_id);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
