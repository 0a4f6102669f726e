//! Transition engine: the single writer of listing state.
//!
//! Each attempt loads the listing, validates the requested edge, and commits
//! state + history + outbox entry through
//! [`LifecycleStore::compare_and_update`]. A version conflict re-runs the whole
//! cycle against the fresh state.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use aetos_core::{AggregateRoot, ExpectedVersion, ListingId};
use aetos_lifecycle::{HistoryEntry, ListingState, Trigger};

use crate::retry::RetryPolicy;
use crate::store::{LifecycleStore, ListingMutation, StoreError};

/// A requested state change.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub listing_id: ListingId,
    pub to_state: ListingState,
    pub reason: Option<String>,
    pub triggered_by: Trigger,
}

impl TransitionRequest {
    pub fn new(listing_id: ListingId, to_state: ListingState, triggered_by: Trigger) -> Self {
        Self {
            listing_id,
            to_state,
            reason: None,
            triggered_by,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Why a transition gave up after retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Every attempt lost the version race.
    Contention,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Contention => f.write_str("contention"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("listing not found: {0}")]
    NotFound(ListingId),

    #[error("invalid transition {current} -> {requested}")]
    InvalidTransition {
        current: ListingState,
        requested: ListingState,
    },

    #[error("a reason is required for this transition (current state {current})")]
    MissingReason { current: ListingState },

    #[error("transition failed after {attempts} attempts ({reason}); current state {current}")]
    TransitionFailed {
        reason: FailureReason,
        attempts: u32,
        current: ListingState,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl TransitionError {
    /// The authoritative state at the time of failure, when known.
    pub fn current_state(&self) -> Option<ListingState> {
        match self {
            TransitionError::InvalidTransition { current, .. }
            | TransitionError::MissingReason { current }
            | TransitionError::TransitionFailed { current, .. } => Some(*current),
            TransitionError::NotFound(_) | TransitionError::Store(_) => None,
        }
    }
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => TransitionError::NotFound(id),
            other => TransitionError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionConfig {
    /// Attempts before giving up on contention.
    pub max_attempts: u32,
    /// Pause between contended attempts.
    pub pause: RetryPolicy,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self::with_max_attempts(5)
    }
}

impl TransitionConfig {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        let max_attempts = max_attempts.max(1);
        Self {
            max_attempts,
            pause: RetryPolicy::linear(
                max_attempts,
                Duration::from_millis(5),
                Duration::from_millis(50),
            ),
        }
    }
}

/// Validates and commits listing state changes.
#[derive(Debug, Clone)]
pub struct TransitionEngine<S> {
    store: S,
    config: TransitionConfig,
}

impl<S> TransitionEngine<S>
where
    S: LifecycleStore,
{
    pub fn new(store: S, config: TransitionConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply a transition, retrying on version conflicts.
    #[instrument(
        skip(self, request),
        fields(
            listing_id = %request.listing_id,
            to = %request.to_state,
            triggered_by = %request.triggered_by
        ),
        err
    )]
    pub async fn transition(
        &self,
        request: TransitionRequest,
    ) -> Result<HistoryEntry, TransitionError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let listing = self.store.get(request.listing_id).await?;
            let current = listing.state();

            if request.triggered_by.requires_reason()
                && request.reason.as_deref().is_none_or(|r| r.trim().is_empty())
            {
                return Err(TransitionError::MissingReason { current });
            }

            let planned = listing
                .plan_transition(
                    request.to_state,
                    request.reason.clone(),
                    request.triggered_by.clone(),
                    Utc::now(),
                )
                .map_err(|e| TransitionError::InvalidTransition {
                    current: e.current,
                    requested: e.requested,
                })?;
            let history = planned.history.clone();
            let mutation = ListingMutation::from_transition(planned)?;

            match self
                .store
                .compare_and_update(
                    request.listing_id,
                    ExpectedVersion::exact(listing.version()),
                    mutation,
                )
                .await
            {
                Ok(updated) => {
                    info!(
                        listing_id = %request.listing_id,
                        from = %current,
                        to = %updated.state(),
                        version = updated.version(),
                        triggered_by = %request.triggered_by,
                        "listing transitioned"
                    );
                    return Ok(history);
                }
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    if attempt >= self.config.max_attempts {
                        let current = match self.store.get(request.listing_id).await {
                            Ok(latest) => latest.state(),
                            Err(_) => current,
                        };
                        warn!(
                            listing_id = %request.listing_id,
                            attempts = attempt,
                            current = %current,
                            "transition gave up after repeated version conflicts"
                        );
                        return Err(TransitionError::TransitionFailed {
                            reason: FailureReason::Contention,
                            attempts: attempt,
                            current,
                        });
                    }
                    debug!(expected, actual, attempt, "version conflict; reloading");
                    tokio::time::sleep(self.config.pause.delay_for_attempt(attempt)).await;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
}
