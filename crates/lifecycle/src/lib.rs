//! Listing lifecycle domain module.
//!
//! This crate contains the lifecycle rules for a tracked listing, implemented
//! purely as deterministic domain logic (no IO, no HTTP, no storage):
//! the state graph, the listing aggregate and its history, and the events a
//! committed change publishes.

pub mod event;
pub mod listing;
pub mod state;

pub use event::LifecycleEvent;
pub use listing::{
    HistoryEntry, Listing, NewListing, SourceAttributes, StateTransition, Trigger,
};
pub use state::{InvalidTransition, ListingState};
