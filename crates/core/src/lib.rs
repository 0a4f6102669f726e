//! `aetos-core`: foundation types shared by every Aetos crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! typed identifiers, the optimistic concurrency expectation, and the base error
//! model.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{EventId, ListingId, ScrapeJobId};
