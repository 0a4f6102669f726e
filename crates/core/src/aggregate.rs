//! Aggregate root trait and the optimistic concurrency expectation.

/// Aggregate root marker + minimal interface.
///
/// A listing is the only aggregate today; the trait keeps the version contract
/// explicit for stores that guard writes with it.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Incremented by exactly one on every committed mutation, so it equals the
    /// number of history entries recorded for the aggregate.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a write.
///
/// Every mutation names the version it was decided against; there is no
/// wildcard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExpectedVersion(u64);

impl ExpectedVersion {
    pub fn exact(version: u64) -> Self {
        Self(version)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn matches(self, actual: u64) -> bool {
        self.0 == actual
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
