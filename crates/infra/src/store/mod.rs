//! Listing store boundary.
//!
//! Listings, their append-only history, and the outbox are written through one
//! [`LifecycleStore`] so a state change and its event commit together.

pub mod in_memory;
pub mod postgres;
pub mod rotation;
pub mod r#trait;

pub use in_memory::InMemoryLifecycleStore;
pub use postgres::PostgresLifecycleStore;
pub use rotation::{NewRotationEntry, RotationEntry, RotationSearch};
pub use r#trait::{
    LifecycleStore, ListingCreation, ListingFilter, ListingMutation, ListingPage, StoreError,
};
