//! The listing state graph.
//!
//! The graph is a static table; nothing outside this module decides whether an
//! edge exists.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use aetos_core::DomainError;

/// Lifecycle state of a listing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingState {
    Found,
    Messaging,
    Negotiating,
    Purchased,
    Received,
    Listed,
    Sold,
    Cancelled,
}

use ListingState::*;

/// Every `(from, to)` edge in the graph.
const EDGES: &[(ListingState, ListingState)] = &[
    (Found, Messaging),
    (Messaging, Negotiating),
    (Negotiating, Purchased),
    (Purchased, Received),
    (Received, Listed),
    (Listed, Sold),
    (Found, Cancelled),
    (Messaging, Cancelled),
    (Negotiating, Cancelled),
    (Purchased, Cancelled),
];

/// A requested edge that does not exist in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {current} -> {requested}")]
pub struct InvalidTransition {
    pub current: ListingState,
    pub requested: ListingState,
}

impl ListingState {
    pub const ALL: [ListingState; 8] = [
        Found,
        Messaging,
        Negotiating,
        Purchased,
        Received,
        Listed,
        Sold,
        Cancelled,
    ];

    /// Validate `self -> requested` against the graph. Self-transitions are
    /// rejected.
    pub fn validate(self, requested: ListingState) -> Result<(), InvalidTransition> {
        if EDGES.contains(&(self, requested)) {
            Ok(())
        } else {
            Err(InvalidTransition {
                current: self,
                requested,
            })
        }
    }

    pub fn can_transition_to(self, requested: ListingState) -> bool {
        self.validate(requested).is_ok()
    }

    /// States reachable from `self` in one step, in graph order.
    pub fn allowed_from(self) -> Vec<ListingState> {
        EDGES
            .iter()
            .filter(|(from, _)| *from == self)
            .map(|(_, to)| *to)
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Sold | Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Found => "FOUND",
            Messaging => "MESSAGING",
            Negotiating => "NEGOTIATING",
            Purchased => "PURCHASED",
            Received => "RECEIVED",
            Listed => "LISTED",
            Sold => "SOLD",
            Cancelled => "CANCELLED",
        }
    }

    /// Routing key of the event announcing entry into this state.
    pub fn routing_key(self) -> &'static str {
        match self {
            Found => "listing.state.found",
            Messaging => "listing.state.messaging",
            Negotiating => "listing.state.negotiating",
            Purchased => "listing.state.purchased",
            Received => "listing.state.received",
            Listed => "listing.state.listed",
            Sold => "listing.state.sold",
            Cancelled => "listing.state.cancelled",
        }
    }
}

impl fmt::Display for ListingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ListingState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DomainError::validation(format!("unknown listing state: {s}")))
    }
}
